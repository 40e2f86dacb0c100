//! UDP DNS server
//!
//! Plain RFC 1035 datagram endpoint. Every received datagram is handed to
//! the dispatcher with the peer address as the requester token; responses go
//! straight back out on the shared socket.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::DnsServer;
use crate::config::ProxyConfig;
use crate::dns::dispatch::{Dispatcher, Responder};
use crate::error::ProxyResult;

/// Default UDP DNS port
pub const DNS_PORT: u16 = 53;

/// Datagram receive buffer size
const MAX_DATAGRAM: usize = 4096;

/// DNS over UDP server
pub struct UdpServer {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

/// Routes responses back out on the serving socket
///
/// Holds the socket weakly: closing the server drops the socket, and late
/// upstream responses are then discarded instead of being sent.
struct UdpResponder {
    socket: Weak<UdpSocket>,
}

#[async_trait]
impl Responder<SocketAddr> for UdpResponder {
    async fn send_response_to_requester(&self, response: Vec<u8>, requester: SocketAddr) {
        let Some(socket) = self.socket.upgrade() else {
            debug!("Discarding response for {}: server closed", requester);
            return;
        };
        if let Err(e) = socket.send_to(&response, requester).await {
            warn!("Failed to send response to {}: {}", requester, e);
        }
    }
}

impl UdpServer {
    /// Bind the server and start its receive loop
    pub async fn bind(
        host: &str,
        port: u16,
        dispatcher: Dispatcher,
        config: &ProxyConfig,
    ) -> ProxyResult<Self> {
        let socket = UdpSocket::bind((host, port)).await?;
        if config.do_not_auto_flow_label {
            disable_auto_flow_label(&socket)?;
        }
        let local_addr = socket.local_addr()?;
        info!("UDP DNS server bound to {}", local_addr);

        let socket = Arc::new(socket);
        let task = tokio::spawn(run(socket, dispatcher));
        Ok(Self {
            local_addr,
            task: Some(task),
        })
    }
}

async fn run(socket: Arc<UdpSocket>, dispatcher: Dispatcher) {
    let responder: Arc<dyn Responder<SocketAddr>> = Arc::new(UdpResponder {
        socket: Arc::downgrade(&socket),
    });
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                debug!("Received {} bytes from {}", len, peer);
                dispatcher.dispatch(buf[..len].to_vec(), peer, responder.clone());
            }
            Err(e) => {
                error!("Error receiving UDP packet: {}", e);
            }
        }
    }
}

#[async_trait]
impl DnsServer for UdpServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("UDP DNS server on {} closed", self.local_addr);
        }
    }
}

/// Clear IPV6_AUTOFLOWLABEL on the bound socket
///
/// The option is Linux-specific and not exposed by libc, hence the raw
/// option number. IPv4 sockets are left alone.
#[cfg(target_os = "linux")]
fn disable_auto_flow_label(socket: &UdpSocket) -> ProxyResult<()> {
    use std::os::fd::AsRawFd;

    const IPV6_AUTOFLOWLABEL: libc::c_int = 70;

    if !socket.local_addr()?.is_ipv6() {
        debug!("do_not_auto_flow_label ignored on an IPv4 socket");
        return Ok(());
    }
    let off: libc::c_int = 0;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            IPV6_AUTOFLOWLABEL,
            &off as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(crate::error::ProxyError::Io(
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn disable_auto_flow_label(_socket: &UdpSocket) -> ProxyResult<()> {
    Err(crate::error::ProxyError::UnsupportedPlatform(
        "do_not_auto_flow_label",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::upstream::{AddressSpec, MockDnsUpstream, Upstream};
    use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RData, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use std::net::Ipv6Addr;
    use std::time::Duration;

    fn mock_dispatcher() -> Dispatcher {
        let upstream: Arc<dyn Upstream> = Arc::new(
            MockDnsUpstream::new(None, Some(&AddressSpec::Text("2001:db8::1".into()))).unwrap(),
        );
        Dispatcher::new(upstream, None)
    }

    fn aaaa_query(id: u16) -> Vec<u8> {
        let mut query = Message::new();
        query.set_id(id).set_message_type(MessageType::Query);
        query.add_query(Query::query(
            Name::from_ascii("example.org.").unwrap(),
            RecordType::AAAA,
        ));
        query.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_udp_server_end_to_end() {
        let config = ProxyConfig::default();
        let server = UdpServer::bind("127.0.0.1", 0, mock_dispatcher(), &config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&aaaa_query(0), addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(response.id(), 0);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        let expected: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(response
            .answers()
            .iter()
            .any(|r| matches!(r.data(), RData::AAAA(aaaa) if aaaa.0 == expected)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let config = ProxyConfig::default();
        let mut server = UdpServer::bind("127.0.0.1", 0, mock_dispatcher(), &config)
            .await
            .unwrap();
        server.close().await;
        server.close().await;
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn test_flow_label_flag_fails_off_linux() {
        let config = ProxyConfig {
            do_not_auto_flow_label: true,
            ..Default::default()
        };
        let result = UdpServer::bind("127.0.0.1", 0, mock_dispatcher(), &config).await;
        assert!(matches!(
            result,
            Err(crate::error::ProxyError::UnsupportedPlatform(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_flow_label_flag_on_ipv6_socket() {
        let config = ProxyConfig {
            do_not_auto_flow_label: true,
            ..Default::default()
        };
        let server = UdpServer::bind("::1", 0, mock_dispatcher(), &config).await;
        assert!(server.is_ok());
    }
}
