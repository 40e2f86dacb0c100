//! Startup orchestration
//!
//! Parses the command line, merges it over the file configuration, builds
//! the shared upstream client and starts every configured transport. Runs
//! until a shutdown signal arrives, then closes all servers.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use crate::cli::Cli;
use crate::config::ProxyConfig;
use crate::dns::{Dispatcher, DnsUpstream, MockDnsUpstream, Transport, Upstream};
use crate::server::coap::{self, CoapServer};
use crate::server::dtls::{self, DtlsServer};
use crate::server::udp::{self, UdpServer};
use crate::server::DnsServer;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::log::init("info");

    let mut config = match &cli.config_file {
        Some(path) => ProxyConfig::load_file(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    config.merge(cli.overlay()?);

    let servers = start_servers(&config).await?;
    info!("snapdns started with {} transport(s)", servers.len());

    shutdown_signal().await;
    info!("Shutting down snapdns...");
    close_all(servers).await;
    info!("snapdns stopped");
    Ok(())
}

/// Build the upstream and start every configured transport
pub async fn start_servers(config: &ProxyConfig) -> Result<Vec<Box<dyn DnsServer>>> {
    let upstream = build_upstream(config)?;
    let dispatcher = Dispatcher::new(upstream, None);

    let mut servers: Vec<Box<dyn DnsServer>> = Vec::new();
    if let Some(listen) = &config.transports.udp {
        let port = listen.port.unwrap_or(udp::DNS_PORT);
        servers.push(Box::new(
            UdpServer::bind(&listen.host, port, dispatcher.clone(), config).await?,
        ));
    }
    if let Some(listen) = &config.transports.dtls {
        let port = listen.port.unwrap_or(dtls::DNS_OVER_DTLS_PORT);
        servers.push(Box::new(
            DtlsServer::bind(&listen.host, port, dispatcher.clone(), config).await?,
        ));
    }
    if let Some(listen) = &config.transports.coap {
        let port = listen.port.unwrap_or(coap::COAP_PORT);
        servers.push(Box::new(
            CoapServer::bind(
                &listen.host,
                port,
                listen.path.as_deref(),
                dispatcher.clone(),
                config,
            )
            .await?,
        ));
    }
    if servers.is_empty() {
        bail!("no proxy transports configured");
    }
    Ok(servers)
}

/// The mock upstream takes precedence over a configured real one
fn build_upstream(config: &ProxyConfig) -> Result<Arc<dyn Upstream>> {
    if let Some(mock) = &config.mock_dns_upstream {
        let mock = MockDnsUpstream::new(mock.class_in.a.as_ref(), mock.class_in.aaaa.as_ref())?;
        return Ok(Arc::new(mock));
    }
    let Some(upstream) = &config.upstream_dns else {
        bail!("no upstream DNS server provided");
    };
    let transport = upstream.transport.unwrap_or(Transport::Udp);
    Ok(Arc::new(DnsUpstream::new(
        upstream.host.clone(),
        upstream.port,
        transport,
    )))
}

/// Close all servers concurrently
pub async fn close_all(mut servers: Vec<Box<dyn DnsServer>>) {
    futures::future::join_all(servers.iter_mut().map(|server| server.close())).await;
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenConfig, MockClassIn, MockUpstreamConfig, TransportsConfig};
    use crate::dns::upstream::AddressSpec;

    fn mock_config() -> ProxyConfig {
        ProxyConfig {
            mock_dns_upstream: Some(MockUpstreamConfig {
                class_in: MockClassIn {
                    a: Some(AddressSpec::Text("10.0.0.1".into())),
                    aaaa: Some(AddressSpec::Text("2001:db8::1".into())),
                },
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_upstream_is_an_error() {
        let config = ProxyConfig {
            transports: TransportsConfig {
                udp: Some(ListenConfig {
                    host: "127.0.0.1".into(),
                    port: Some(0),
                    path: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(start_servers(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_no_transports_is_an_error() {
        let config = mock_config();
        assert!(start_servers(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_udp_transport_starts_and_closes() {
        let mut config = mock_config();
        config.transports.udp = Some(ListenConfig {
            host: "127.0.0.1".into(),
            port: Some(0),
            path: None,
        });
        let servers = start_servers(&config).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].local_addr().is_some());
        close_all(servers).await;
    }
}
