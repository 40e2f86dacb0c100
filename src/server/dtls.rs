//! DTLS DNS server
//!
//! Composes a datagram endpoint with one DTLS session layer. Decrypted
//! payloads are dispatched upstream with the DTLS peer address as the
//! requester token; responses are encrypted back to the exact peer. The
//! wrapper lives inside one task, so queries and responses meet in a
//! `select!` loop instead of sharing state.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::DnsServer;
use crate::config::ProxyConfig;
use crate::dns::dispatch::{Dispatcher, Responder};
use crate::dtls::DtlsWrapper;
use crate::error::{ProxyError, ProxyResult};

/// Default DNS-over-DTLS port
pub const DNS_OVER_DTLS_PORT: u16 = 853;

const MAX_DATAGRAM: usize = 4096;

enum Command {
    Respond(Vec<u8>, SocketAddr),
    Shutdown,
}

/// DNS over DTLS server
pub struct DtlsServer {
    local_addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

/// Hands responses back to the server task owning the session layer
struct DtlsResponder {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl Responder<SocketAddr> for DtlsResponder {
    async fn send_response_to_requester(&self, response: Vec<u8>, requester: SocketAddr) {
        if self
            .cmd_tx
            .send(Command::Respond(response, requester))
            .is_err()
        {
            debug!("Discarding response for {}: server closed", requester);
        }
    }
}

impl DtlsServer {
    /// Bind the server and start its session loop
    ///
    /// Fails when the configuration carries no DTLS credentials.
    pub async fn bind(
        host: &str,
        port: u16,
        dispatcher: Dispatcher,
        config: &ProxyConfig,
    ) -> ProxyResult<Self> {
        let credentials = config
            .dtls_credentials
            .as_ref()
            .ok_or(ProxyError::MissingCredential("dtls_credentials"))?;

        let socket = Arc::new(UdpSocket::bind((host, port)).await?);
        let local_addr = socket.local_addr()?;
        let wrapper = DtlsWrapper::new(socket.clone(), credentials, config.hello_done_delay())?;
        info!("DTLS DNS server bound to {}", local_addr);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(socket, wrapper, dispatcher, cmd_tx.clone(), cmd_rx));
        Ok(Self {
            local_addr,
            cmd_tx,
            task: Some(task),
        })
    }
}

async fn run(
    socket: Arc<UdpSocket>,
    mut wrapper: DtlsWrapper,
    dispatcher: Dispatcher,
    cmd_tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let responder: Arc<dyn Responder<SocketAddr>> = Arc::new(DtlsResponder { cmd_tx });
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, peer)) => {
                    let (data, requester, _) = wrapper.handle_message(&buf[..len], peer).await;
                    if let (Some(query), Some(requester)) = (data, requester) {
                        dispatcher.dispatch(query, requester, responder.clone());
                    }
                }
                Err(e) => {
                    error!("Error receiving DTLS datagram: {}", e);
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Respond(response, peer)) => {
                    wrapper.write(&response, peer).await;
                }
                Some(Command::Shutdown) | None => break,
            },
        }
    }
    wrapper.close_all().await;
}

#[async_trait]
impl DnsServer for DtlsServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.cmd_tx.send(Command::Shutdown);
            let _ = task.await;
            info!("DTLS DNS server on {} closed", self.local_addr);
        }
    }
}
