//! CoAP DNS server
//!
//! Serves DNS over CoAP (RFC 8484 semantics with the application/dns-message
//! content format) on a plain UDP endpoint, and additionally over CoAPS via
//! the DTLS session layer when PSK credentials are configured. One resource
//! handles GET (base64url `dns` query parameter), POST and FETCH; a
//! `/.well-known/core` listing advertises it.
//!
//! Each accepted request mints a fresh token for the pending-response map,
//! so identical back-to-back queries rendezvous independently.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use coap_lite::{CoapOption, CoapResponse, MessageClass, Packet, RequestType, ResponseType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::DnsServer;
use crate::config::ProxyConfig;
use crate::dns::dispatch::{Dispatcher, Responder};
use crate::dtls::DtlsWrapper;
use crate::error::ProxyResult;

/// Default CoAP port
pub const COAP_PORT: u16 = 5683;
/// Default CoAPS port
pub const COAPS_PORT: u16 = 5684;

/// IANA content format for application/dns-message
pub const CONTENT_FORMAT_DNS_MESSAGE: u32 = 553;
/// Pre-registration value used by early DNS-over-CoAP drafts
const CONTENT_FORMAT_DNS_MESSAGE_LEGACY: u32 = 65053;
/// Content format for application/link-format
const CONTENT_FORMAT_LINK_FORMAT: u32 = 40;

/// Default resource path
const DEFAULT_RESOURCE_PATH: &str = "dns";
const WELL_KNOWN_CORE: &str = ".well-known/core";

const MAX_DATAGRAM: usize = 4096;

/// Extra slack on top of the upstream lifetime before a pending slot is
/// abandoned with 5.03
const PENDING_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_PENDING_LIFETIME: Duration = Duration::from_secs(5);

/// Pending-response map
///
/// Keyed by a monotonically increasing token minted per request; the token
/// travels through the dispatcher as the requester, so two identical queries
/// in flight never share a slot.
#[derive(Clone, Default)]
struct PendingResponses {
    slots: Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>,
    next_token: Arc<AtomicU64>,
}

impl PendingResponses {
    fn insert(&self) -> (u64, oneshot::Receiver<Vec<u8>>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(token, tx);
        (token, rx)
    }

    fn forget(&self, token: u64) {
        self.slots.lock().unwrap().remove(&token);
    }

    fn fulfill(&self, token: u64, response: Vec<u8>) {
        let sender = self.slots.lock().unwrap().remove(&token);
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                debug_assert!(false, "pending slot {token} vanished");
                warn!("No pending response slot for token {}", token);
            }
        }
    }
}

#[async_trait]
impl Responder<u64> for PendingResponses {
    async fn send_response_to_requester(&self, response: Vec<u8>, requester: u64) {
        self.fulfill(requester, response);
    }
}

/// The DNS query resource, shared by the CoAP and CoAPS endpoints
struct DnsResource {
    dispatcher: Dispatcher,
    pending: PendingResponses,
    path: String,
}

impl DnsResource {
    fn new(dispatcher: Dispatcher, path: &str) -> Self {
        Self {
            dispatcher,
            pending: PendingResponses::default(),
            path: path.trim_matches('/').to_string(),
        }
    }

    /// Serve one CoAP datagram; returns the serialized response, if any
    async fn handle_packet(&self, packet: Packet, source: SocketAddr) -> Option<Vec<u8>> {
        let MessageClass::Request(method) = packet.header.code else {
            debug!("Ignoring non-request CoAP message from {}", source);
            return None;
        };
        let response = CoapResponse::new(&packet)?;
        let path = request_path(&packet);

        if path == WELL_KNOWN_CORE && method == RequestType::Get {
            let listing = format!("</{}>;ct={}", self.path, CONTENT_FORMAT_DNS_MESSAGE);
            return finish(
                response,
                ResponseType::Content,
                listing.into_bytes(),
                Some(CONTENT_FORMAT_LINK_FORMAT),
            );
        }
        if path != self.path {
            debug!("CoAP request from {} for unknown path /{}", source, path);
            return finish(response, ResponseType::NotFound, Vec::new(), None);
        }

        match self.render(&packet, method).await {
            Ok((status, payload)) => finish(
                response,
                status,
                payload,
                Some(CONTENT_FORMAT_DNS_MESSAGE),
            ),
            Err(status) => finish(response, status, Vec::new(), None),
        }
    }

    /// Method-independent request core
    async fn render(
        &self,
        packet: &Packet,
        method: RequestType,
    ) -> Result<(ResponseType, Vec<u8>), ResponseType> {
        let query = match method {
            RequestType::Get => {
                let encoded =
                    uri_query_param(packet, "dns").ok_or(ResponseType::BadRequest)?;
                decode_base64url(&encoded).map_err(|_| ResponseType::BadRequest)?
            }
            RequestType::Post | RequestType::Fetch => {
                match option_uint(packet, CoapOption::ContentFormat) {
                    Some(format) if is_dns_message(format) => packet.payload.clone(),
                    _ => return Err(ResponseType::UnsupportedContentFormat),
                }
            }
            _ => return Err(ResponseType::MethodNotAllowed),
        };

        if let Some(accept) = option_uint(packet, CoapOption::Accept) {
            if !is_dns_message(accept) {
                return Err(ResponseType::NotAcceptable);
            }
        }

        let (token, slot) = self.pending.insert();
        self.dispatcher
            .dispatch(query, token, Arc::new(self.pending.clone()));

        let lifetime =
            self.dispatcher.timeout().unwrap_or(DEFAULT_PENDING_LIFETIME) + PENDING_GRACE;
        let dns_response = match tokio::time::timeout(lifetime, slot).await {
            Ok(Ok(response)) => response,
            _ => {
                // dropped query or a slot that never got fulfilled
                self.pending.forget(token);
                return Err(ResponseType::ServiceUnavailable);
            }
        };

        let status = if method == RequestType::Post {
            ResponseType::Changed
        } else {
            ResponseType::Content
        };
        Ok((status, dns_response))
    }
}

/// DNS over CoAP server (with optional CoAPS endpoint)
pub struct CoapServer {
    local_addr: SocketAddr,
    coaps_addr: Option<SocketAddr>,
    udp_task: Option<JoinHandle<()>>,
    coaps_task: Option<JoinHandle<()>>,
    coaps_tx: Option<mpsc::UnboundedSender<CoapsCommand>>,
}

enum CoapsCommand {
    Respond(Vec<u8>, SocketAddr),
    Shutdown,
}

impl CoapServer {
    /// Bind the CoAP endpoint, plus CoAPS when credentials are configured
    pub async fn bind(
        host: &str,
        port: u16,
        path: Option<&str>,
        dispatcher: Dispatcher,
        config: &ProxyConfig,
    ) -> ProxyResult<Self> {
        let resource = Arc::new(DnsResource::new(
            dispatcher,
            path.unwrap_or(DEFAULT_RESOURCE_PATH),
        ));

        let socket = Arc::new(UdpSocket::bind((host, port)).await?);
        let local_addr = socket.local_addr()?;
        info!(
            "CoAP DNS server bound to {} (resource /{})",
            local_addr, resource.path
        );
        let udp_task = tokio::spawn(run_udp(socket, resource.clone()));

        let mut coaps_addr = None;
        let mut coaps_task = None;
        let mut coaps_tx = None;
        if let Some(credentials) = &config.dtls_credentials {
            // an ephemeral CoAP port gets an ephemeral CoAPS port too
            let coaps_port = if port == 0 { 0 } else { COAPS_PORT };
            let socket = Arc::new(UdpSocket::bind((host, coaps_port)).await?);
            let addr = socket.local_addr()?;
            let wrapper =
                DtlsWrapper::new(socket.clone(), credentials, config.hello_done_delay())?;
            info!("CoAPS DNS server bound to {}", addr);

            let (tx, rx) = mpsc::unbounded_channel();
            coaps_task = Some(tokio::spawn(run_coaps(
                socket,
                wrapper,
                resource.clone(),
                tx.clone(),
                rx,
            )));
            coaps_addr = Some(addr);
            coaps_tx = Some(tx);
        }

        Ok(Self {
            local_addr,
            coaps_addr,
            udp_task: Some(udp_task),
            coaps_task,
            coaps_tx,
        })
    }

    /// The CoAPS endpoint address, when credentials were configured
    pub fn coaps_addr(&self) -> Option<SocketAddr> {
        self.coaps_addr
    }
}

async fn run_udp(socket: Arc<UdpSocket>, resource: Arc<DnsResource>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = match Packet::from_bytes(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Dropping unparsable CoAP datagram from {}: {:?}", peer, e);
                        continue;
                    }
                };
                let resource = resource.clone();
                let socket = Arc::downgrade(&socket);
                tokio::spawn(async move {
                    if let Some(response) = resource.handle_packet(packet, peer).await {
                        let Some(socket) = socket.upgrade() else {
                            debug!("Discarding CoAP response for {}: server closed", peer);
                            return;
                        };
                        if let Err(e) = socket.send_to(&response, peer).await {
                            warn!("Failed to send CoAP response to {}: {}", peer, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Error receiving CoAP datagram: {}", e);
            }
        }
    }
}

async fn run_coaps(
    socket: Arc<UdpSocket>,
    mut wrapper: DtlsWrapper,
    resource: Arc<DnsResource>,
    cmd_tx: mpsc::UnboundedSender<CoapsCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<CoapsCommand>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, peer)) => {
                    let (data, requester, _) = wrapper.handle_message(&buf[..len], peer).await;
                    if let (Some(data), Some(peer)) = (data, requester) {
                        match Packet::from_bytes(&data) {
                            Ok(packet) => {
                                let resource = resource.clone();
                                let tx = cmd_tx.clone();
                                tokio::spawn(async move {
                                    if let Some(response) =
                                        resource.handle_packet(packet, peer).await
                                    {
                                        let _ = tx.send(CoapsCommand::Respond(response, peer));
                                    }
                                });
                            }
                            Err(e) => {
                                debug!(
                                    "Dropping unparsable CoAPS payload from {}: {:?}",
                                    peer, e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Error receiving CoAPS datagram: {}", e);
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(CoapsCommand::Respond(response, peer)) => {
                    wrapper.write(&response, peer).await;
                }
                Some(CoapsCommand::Shutdown) | None => break,
            },
        }
    }
    wrapper.close_all().await;
}

#[async_trait]
impl DnsServer for CoapServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn close(&mut self) {
        let mut was_open = false;
        if let Some(task) = self.udp_task.take() {
            was_open = true;
            task.abort();
            let _ = task.await;
        }
        if let Some(tx) = self.coaps_tx.take() {
            let _ = tx.send(CoapsCommand::Shutdown);
        }
        if let Some(task) = self.coaps_task.take() {
            let _ = task.await;
        }
        if was_open {
            info!("CoAP DNS server on {} closed", self.local_addr);
        }
    }
}

/// Serialize a response with the given status, payload and content format
fn finish(
    mut response: CoapResponse,
    status: ResponseType,
    payload: Vec<u8>,
    content_format: Option<u32>,
) -> Option<Vec<u8>> {
    response.message.header.code = MessageClass::Response(status);
    response.message.payload = payload;
    if let Some(format) = content_format {
        response.message.clear_option(CoapOption::ContentFormat);
        response
            .message
            .add_option(CoapOption::ContentFormat, encode_uint_option(format));
    }
    response.message.to_bytes().ok()
}

fn request_path(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Look up `key` among the Uri-Query options
fn uri_query_param(packet: &Packet, key: &str) -> Option<String> {
    for option in packet.get_option(CoapOption::UriQuery)? {
        let pair = String::from_utf8_lossy(option);
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Decode the first value of a uint-valued CoAP option
fn option_uint(packet: &Packet, option: CoapOption) -> Option<u32> {
    packet
        .get_option(option)?
        .front()
        .map(|value| value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn is_dns_message(content_format: u32) -> bool {
    content_format == CONTENT_FORMAT_DNS_MESSAGE
        || content_format == CONTENT_FORMAT_DNS_MESSAGE_LEGACY
}

/// Base64url-decode after re-padding with `=` up to a multiple of four
fn decode_base64url(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let padded = match value.len() % 4 {
        0 => value.to_string(),
        n => format!("{}{}", value, "=".repeat(4 - n)),
    };
    base64::engine::general_purpose::URL_SAFE.decode(padded)
}
