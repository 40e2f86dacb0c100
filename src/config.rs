//! Configuration
//!
//! Loads the proxy configuration from a YAML file and merges the command
//! line over it, key by key, with the command line winning. The merged value
//! is frozen before any server starts and passed by reference into the
//! server factories; nothing mutates it afterwards.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dns::upstream::{AddressSpec, Transport};
use crate::error::{ProxyError, ProxyResult};

/// Proxy configuration
///
/// Every section is optional in the file; what is required for a given run
/// (an upstream, at least one transport, DTLS credentials when DTLS or CoAPS
/// is enabled) is validated at startup.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// The proxied upstream DNS server
    pub upstream_dns: Option<UpstreamConfig>,
    /// Mock upstream answering from fixed addresses; takes precedence over
    /// `upstream_dns` when present
    pub mock_dns_upstream: Option<MockUpstreamConfig>,
    /// Client-facing transports to serve on
    #[serde(default)]
    pub transports: TransportsConfig,
    /// PSK credentials for DTLS and CoAPS
    pub dtls_credentials: Option<DtlsCredentials>,
    /// DTLS tuning knobs
    #[serde(default)]
    pub dtls: DtlsConfig,
    /// Clear IPV6_AUTOFLOWLABEL on bound IPv6 sockets (Linux only)
    #[serde(default)]
    pub do_not_auto_flow_label: bool,
}

/// Upstream server section
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: Option<u16>,
    pub transport: Option<Transport>,
}

/// Mock upstream section, keyed by record class
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct MockUpstreamConfig {
    #[serde(rename = "IN", default)]
    pub class_in: MockClassIn,
}

/// Fixed class-IN addresses for the mock upstream
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct MockClassIn {
    #[serde(rename = "A")]
    pub a: Option<AddressSpec>,
    #[serde(rename = "AAAA")]
    pub aaaa: Option<AddressSpec>,
}

/// Per-transport listen addresses
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TransportsConfig {
    pub udp: Option<ListenConfig>,
    pub dtls: Option<ListenConfig>,
    pub coap: Option<ListenConfig>,
}

/// One listen endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ListenConfig {
    pub host: String,
    pub port: Option<u16>,
    /// CoAP resource path; ignored by the other transports
    pub path: Option<String>,
}

/// PSK credentials shared by the DTLS and CoAPS servers
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DtlsCredentials {
    pub client_identity: String,
    pub psk: String,
}

/// DTLS tuning knobs
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DtlsConfig {
    /// Seconds to hold back a ServerHelloDone record, pacing for slow
    /// constrained peers
    pub server_hello_done_delay: Option<f64>,
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn load_file<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::Config(format!(
                "failed to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Merge another configuration over this one, key by key
    ///
    /// Set keys in `overlay` win; unset keys keep the current value. Used to
    /// apply command-line arguments over the file configuration.
    pub fn merge(&mut self, overlay: ProxyConfig) {
        if overlay.upstream_dns.is_some() {
            self.upstream_dns = overlay.upstream_dns;
        }
        if overlay.mock_dns_upstream.is_some() {
            self.mock_dns_upstream = overlay.mock_dns_upstream;
        }
        if overlay.transports.udp.is_some() {
            self.transports.udp = overlay.transports.udp;
        }
        if overlay.transports.dtls.is_some() {
            self.transports.dtls = overlay.transports.dtls;
        }
        if overlay.transports.coap.is_some() {
            self.transports.coap = overlay.transports.coap;
        }
        if overlay.dtls_credentials.is_some() {
            self.dtls_credentials = overlay.dtls_credentials;
        }
        if overlay.dtls.server_hello_done_delay.is_some() {
            self.dtls.server_hello_done_delay = overlay.dtls.server_hello_done_delay;
        }
        if overlay.do_not_auto_flow_label {
            self.do_not_auto_flow_label = true;
        }
    }

    /// Get the ServerHelloDone pacing delay, when configured and positive
    pub fn hello_done_delay(&self) -> Option<Duration> {
        self.dtls
            .server_hello_done_delay
            .filter(|d| *d > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
upstream_dns:
  host: "::1"
  port: 5300
  transport: udp+tcp
transports:
  udp:
    host: localhost
  dtls:
    host: localhost
    port: 2304
  coap:
    host: localhost
    path: dns-query
dtls_credentials:
  client_identity: Client_identifier
  psk: secretPSK
dtls:
  server_hello_done_delay: 0.5
do_not_auto_flow_label: true
"#
        )
        .unwrap();

        let config = ProxyConfig::load_file(file.path()).unwrap();
        let upstream = config.upstream_dns.as_ref().unwrap();
        assert_eq!(upstream.host, "::1");
        assert_eq!(upstream.port, Some(5300));
        assert_eq!(upstream.transport, Some(Transport::UdpTcpFallback));
        assert_eq!(config.transports.udp.as_ref().unwrap().host, "localhost");
        assert_eq!(config.transports.udp.as_ref().unwrap().port, None);
        assert_eq!(config.transports.dtls.as_ref().unwrap().port, Some(2304));
        assert_eq!(
            config.transports.coap.as_ref().unwrap().path.as_deref(),
            Some("dns-query")
        );
        let creds = config.dtls_credentials.as_ref().unwrap();
        assert_eq!(creds.client_identity, "Client_identifier");
        assert_eq!(creds.psk, "secretPSK");
        assert_eq!(config.hello_done_delay(), Some(Duration::from_millis(500)));
        assert!(config.do_not_auto_flow_label);
    }

    #[test]
    fn test_mock_upstream_yaml_forms() {
        let config: ProxyConfig = serde_yaml::from_str(
            r#"
mock_dns_upstream:
  IN:
    A: 10.0.0.1
    AAAA: [32, 1, 13, 184, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
"#,
        )
        .unwrap();
        let mock = config.mock_dns_upstream.unwrap();
        assert_eq!(mock.class_in.a, Some(AddressSpec::Text("10.0.0.1".into())));
        assert!(matches!(mock.class_in.aaaa, Some(AddressSpec::Raw(ref v)) if v.len() == 16));
    }

    #[test]
    fn test_cli_wins_key_by_key() {
        let mut config: ProxyConfig = serde_yaml::from_str(
            r#"
upstream_dns:
  host: 9.9.9.9
transports:
  udp:
    host: localhost
    port: 5353
"#,
        )
        .unwrap();

        let overlay = ProxyConfig {
            upstream_dns: Some(UpstreamConfig {
                host: "::1".into(),
                port: Some(53),
                transport: Some(Transport::Tcp),
            }),
            ..Default::default()
        };
        config.merge(overlay);

        assert_eq!(config.upstream_dns.as_ref().unwrap().host, "::1");
        // untouched keys survive
        assert_eq!(config.transports.udp.as_ref().unwrap().port, Some(5353));
    }

    #[test]
    fn test_hello_done_delay_zero_disabled() {
        let config: ProxyConfig = serde_yaml::from_str(
            r#"
dtls:
  server_hello_done_delay: 0.0
"#,
        )
        .unwrap();
        assert_eq!(config.hello_done_delay(), None);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(ProxyConfig::load_file("/nonexistent/snapdns.yaml").is_err());
    }
}
