//! Command line interface
//!
//! Mirrors the configuration file schema: every flag parses into a partial
//! `ProxyConfig` that is merged over the file, key by key, with the command
//! line winning.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{DtlsCredentials, ListenConfig, ProxyConfig, UpstreamConfig};
use crate::dns::upstream::Transport;
use crate::error::{ProxyError, ProxyResult};

const DEFAULT_HOST: &str = "localhost";

/// A datagram-based DNS-over-X proxy
#[derive(Debug, Parser)]
#[command(name = "snapdns", version, about)]
pub struct Cli {
    /// Config YAML file
    #[arg(short = 'C', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Start DNS-over-UDP proxy
    #[arg(short = 'u', long = "udp", num_args = 0..=2, value_names = ["HOST", "PORT"])]
    pub udp: Option<Vec<String>>,

    /// Start DNS-over-DTLS proxy
    #[arg(short = 'd', long = "dtls", num_args = 0..=2, value_names = ["HOST", "PORT"])]
    pub dtls: Option<Vec<String>>,

    /// Start DNS-over-CoAP proxy
    #[arg(short = 'c', long = "coap", num_args = 0..=2, value_names = ["HOST", "PORT"])]
    pub coap: Option<Vec<String>>,

    /// DTLS credentials
    #[arg(long = "dtls-credentials", num_args = 2, value_names = ["CLIENT_ID", "PSK"])]
    pub dtls_credentials: Option<Vec<String>>,

    /// Upstream server configuration: [{udp,tcp,udp+tcp}] HOST [PORT].
    /// Required either as CLI argument or via config file. udp+tcp tries
    /// UDP first, then falls back to TCP.
    #[arg(
        short = 'U',
        long = "upstream-dns",
        num_args = 1..=3,
        value_name = "[TRANSPORT] HOST [PORT]"
    )]
    pub upstream_dns: Option<Vec<String>>,
}

impl Cli {
    /// Convert the parsed arguments into a partial configuration overlay
    pub fn overlay(&self) -> ProxyResult<ProxyConfig> {
        let mut overlay = ProxyConfig::default();
        overlay.transports.udp = self
            .udp
            .as_deref()
            .map(|values| parse_listen(values, "--udp"))
            .transpose()?;
        overlay.transports.dtls = self
            .dtls
            .as_deref()
            .map(|values| parse_listen(values, "--dtls"))
            .transpose()?;
        overlay.transports.coap = self
            .coap
            .as_deref()
            .map(|values| parse_listen(values, "--coap"))
            .transpose()?;
        if let Some(values) = &self.dtls_credentials {
            overlay.dtls_credentials = Some(DtlsCredentials {
                client_identity: values[0].clone(),
                psk: values[1].clone(),
            });
        }
        if let Some(values) = &self.upstream_dns {
            overlay.upstream_dns = Some(parse_upstream(values)?);
        }
        Ok(overlay)
    }
}

/// Parse `[HOST [PORT]]`; a bare flag means the default host and port
fn parse_listen(values: &[String], option: &str) -> ProxyResult<ListenConfig> {
    let host = values
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = values
        .get(1)
        .map(|raw| parse_port(raw, option))
        .transpose()?;
    Ok(ListenConfig {
        host,
        port,
        path: None,
    })
}

/// Parse `[{udp,tcp,udp+tcp}] HOST [PORT]`; the transport defaults to UDP
fn parse_upstream(values: &[String]) -> ProxyResult<UpstreamConfig> {
    match values {
        [host] => Ok(UpstreamConfig {
            host: host.clone(),
            port: None,
            transport: None,
        }),
        [host, port] => Ok(UpstreamConfig {
            host: host.clone(),
            port: Some(parse_port(port, "--upstream-dns")?),
            transport: None,
        }),
        [transport, host, port] => Ok(UpstreamConfig {
            host: host.clone(),
            port: Some(parse_port(port, "--upstream-dns")?),
            transport: Some(Transport::from_str(transport)?),
        }),
        _ => Err(ProxyError::Config(
            "--upstream-dns requires 1 to 3 arguments".to_string(),
        )),
    }
}

fn parse_port(raw: &str, option: &str) -> ProxyResult<u16> {
    raw.parse()
        .map_err(|_| ProxyError::Config(format!("{option}: invalid port '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_transport_flags_use_defaults() {
        let cli = Cli::parse_from(["snapdns", "-u", "-U", "::1"]);
        let overlay = cli.overlay().unwrap();
        let udp = overlay.transports.udp.unwrap();
        assert_eq!(udp.host, "localhost");
        assert_eq!(udp.port, None);
        let upstream = overlay.upstream_dns.unwrap();
        assert_eq!(upstream.host, "::1");
        assert_eq!(upstream.port, None);
        assert_eq!(upstream.transport, None);
    }

    #[test]
    fn test_host_and_port_values() {
        let cli = Cli::parse_from([
            "snapdns", "-d", "::1", "2304", "-U", "udp+tcp", "::1", "5300",
        ]);
        let overlay = cli.overlay().unwrap();
        let dtls = overlay.transports.dtls.unwrap();
        assert_eq!(dtls.host, "::1");
        assert_eq!(dtls.port, Some(2304));
        let upstream = overlay.upstream_dns.unwrap();
        assert_eq!(upstream.host, "::1");
        assert_eq!(upstream.port, Some(5300));
        assert_eq!(upstream.transport, Some(Transport::UdpTcpFallback));
    }

    #[test]
    fn test_dtls_credentials() {
        let cli = Cli::parse_from([
            "snapdns",
            "--dtls-credentials",
            "Client_identifier",
            "secretPSK",
            "-U",
            "::1",
        ]);
        let overlay = cli.overlay().unwrap();
        let creds = overlay.dtls_credentials.unwrap();
        assert_eq!(creds.client_identity, "Client_identifier");
        assert_eq!(creds.psk, "secretPSK");
    }

    #[test]
    fn test_too_many_listen_values_rejected() {
        let result = Cli::try_parse_from(["snapdns", "-u", "a", "1", "extra", "-U", "::1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_upstream_transport_rejected() {
        let cli = Cli::parse_from(["snapdns", "-U", "quic", "::1", "53"]);
        assert!(matches!(
            cli.overlay(),
            Err(ProxyError::InvalidTransport(_))
        ));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let cli = Cli::parse_from(["snapdns", "-u", "::1", "notaport", "-U", "::1"]);
        assert!(matches!(cli.overlay(), Err(ProxyError::Config(_))));
    }
}
