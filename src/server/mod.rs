//! Serving transports
//!
//! Provides the client-facing DNS servers:
//! - UDP: plain DNS over UDP (port 53)
//! - DTLS: DNS over DTLS with PSK authentication (port 853)
//! - CoAP: DNS over CoAP, plus CoAPS when DTLS credentials are configured

pub mod coap;
pub mod dtls;
pub mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;

/// Handle to a running DNS server
///
/// Returned by the per-transport factories and kept in a process-wide list
/// until shutdown.
#[async_trait]
pub trait DnsServer: Send {
    /// The local address the server is bound to
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Shut the server down and release its sockets
    ///
    /// Idempotent; after the first call resolves no further I/O is issued.
    async fn close(&mut self);
}
