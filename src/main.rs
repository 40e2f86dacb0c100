//! SnapDNS
//!
//! A datagram DNS proxy that accepts queries over UDP, DTLS (PSK) and
//! CoAP/CoAPS and resolves them against a single upstream recursive
//! resolver reachable via UDP, TCP, or UDP with TCP fallback.

mod bootstrap;
mod cli;
mod config;
mod dns;
mod dtls;
mod error;
mod log;
mod server;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::run().await
}
