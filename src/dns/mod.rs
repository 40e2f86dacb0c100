//! DNS core
//!
//! Provides the upstream client (UDP, TCP, UDP-with-TCP-fallback) and the
//! query dispatch component shared by every serving transport.

pub mod dispatch;
pub mod upstream;

pub use dispatch::{Dispatcher, Responder};
pub use upstream::{AddressSpec, DnsUpstream, MockDnsUpstream, Transport, Upstream};
