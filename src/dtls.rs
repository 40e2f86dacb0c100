//! DTLS session layer
//!
//! Bridges a single connectionless datagram socket to per-peer DTLS state
//! machines. Inbound records are demultiplexed by peer address and fed into
//! that peer's engine; decrypted application data, outbound ciphertext and
//! handshake completion are surfaced through `handle_message` / `write`.
//!
//! The engine is openssl in non-blocking mode: each session runs over an
//! in-memory datagram channel, handshakes are driven through
//! `MidHandshakeSslStream` until they complete, and ciphertext produced by
//! the engine is drained from the channel and sent on the shared socket.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder,
    SslMethod, SslStream,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::DtlsCredentials;
use crate::error::ProxyResult;

/// DTLS record content type for handshake messages
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
/// Handshake message type ServerHelloDone
const HANDSHAKE_SERVER_HELLO_DONE: u8 = 14;
/// DTLS record header length (type, version, epoch, sequence, length)
const RECORD_HEADER_LEN: usize = 13;

/// Path MTU handed to the engine for flight sizing
const DTLS_MTU: u32 = 1400;
/// Read buffer for decrypted application data
const MAX_PLAINTEXT: usize = 4096;

/// In-memory datagram channel between the engine and the socket
///
/// The engine reads inbound ciphertext datagrams from `incoming` and writes
/// outbound records to `outgoing`; both queues are fully drained within the
/// wrapper call that filled them, so no state leaks between records.
#[derive(Clone, Default)]
struct ChannelStream {
    inner: Arc<Mutex<ChannelInner>>,
}

#[derive(Default)]
struct ChannelInner {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl ChannelStream {
    fn push_incoming(&self, datagram: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .incoming
            .push_back(datagram.to_vec());
    }

    fn drain_outgoing(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().outgoing.drain(..).collect()
    }
}

impl Read for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inner.lock().unwrap().incoming.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no datagram pending",
            )),
        }
    }
}

impl Write for ChannelStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().unwrap().outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Direction {
    Accept,
    Connect,
}

enum SessionState {
    Handshaking(MidHandshakeSslStream<ChannelStream>),
    Established(SslStream<ChannelStream>),
    /// Transient placeholder while ownership moves through the handshake pump
    Poisoned,
}

struct DtlsSession {
    chan: ChannelStream,
    state: SessionState,
}

/// Per-endpoint DTLS wrapper over one shared datagram socket
pub struct DtlsWrapper {
    socket: Arc<UdpSocket>,
    ctx: SslContext,
    sessions: HashMap<SocketAddr, DtlsSession>,
    hello_done_delay: Option<Duration>,
}

impl DtlsWrapper {
    /// Create a wrapper with the given PSK credentials
    pub fn new(
        socket: Arc<UdpSocket>,
        credentials: &DtlsCredentials,
        hello_done_delay: Option<Duration>,
    ) -> ProxyResult<Self> {
        let identity = credentials.client_identity.clone().into_bytes();
        let psk = credentials.psk.clone().into_bytes();

        let mut builder = SslContext::builder(SslMethod::dtls())?;
        builder.set_cipher_list("PSK")?;
        install_psk_callbacks(&mut builder, identity, psk);

        Ok(Self {
            socket,
            ctx: builder.build(),
            sessions: HashMap::new(),
            hello_done_delay,
        })
    }

    /// Check whether a session with `peer` is established
    pub fn is_connected(&self, peer: &SocketAddr) -> bool {
        matches!(
            self.sessions.get(peer),
            Some(session) if matches!(session.state, SessionState::Established(_))
        )
    }

    /// All peers with an established session
    pub fn sessions(&self) -> Vec<SocketAddr> {
        self.sessions
            .iter()
            .filter(|(_, s)| matches!(s.state, SessionState::Established(_)))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Initiate a client-side handshake towards `peer`
    pub async fn connect(&mut self, peer: SocketAddr) -> ProxyResult<()> {
        if self.sessions.contains_key(&peer) {
            return Ok(());
        }
        let session = create_session(&self.ctx, Direction::Connect)?;
        let chan = session.chan.clone();
        self.sessions.insert(peer, session);
        // first flight (ClientHello) is already queued
        self.flush_chan(&chan, peer).await;
        Ok(())
    }

    /// Close the session with `peer`, sending close_notify when established
    pub async fn close(&mut self, peer: SocketAddr) {
        if let Some(mut session) = self.sessions.remove(&peer) {
            if let SessionState::Established(stream) = &mut session.state {
                let _ = stream.shutdown();
            }
            self.flush_chan(&session.chan, peer).await;
            debug!("Closed DTLS session with {}", peer);
        }
    }

    /// Close every session
    pub async fn close_all(&mut self) {
        let peers: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.close(peer).await;
        }
    }

    /// Feed one inbound datagram from `peer` into its session
    ///
    /// Returns the decrypted application payload (if the record carried one),
    /// the peer it belongs to, and whether this record completed the
    /// handshake. A record the engine cannot handle is logged and dropped,
    /// yielding `(None, None, false)`.
    pub async fn handle_message(
        &mut self,
        msg: &[u8],
        peer: SocketAddr,
    ) -> (Option<Vec<u8>>, Option<SocketAddr>, bool) {
        let (chan, app_data, newly_connected, drop_session, failed) = {
            let session = match self.sessions.entry(peer) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(slot) => match create_session(&self.ctx, Direction::Accept) {
                    Ok(session) => slot.insert(session),
                    Err(e) => {
                        warn!("Unable to set up DTLS session for {}: {}", peer, e);
                        return (None, None, false);
                    }
                },
            };
            session.chan.push_incoming(msg);

            let mut newly_connected = false;
            let mut drop_session = false;
            let mut failed = false;

            if matches!(session.state, SessionState::Handshaking(_)) {
                match std::mem::replace(&mut session.state, SessionState::Poisoned) {
                    SessionState::Handshaking(mid) => match mid.handshake() {
                        Ok(stream) => {
                            debug!("DTLS session with {} established", peer);
                            session.state = SessionState::Established(stream);
                            newly_connected = true;
                        }
                        Err(HandshakeError::WouldBlock(mid)) => {
                            session.state = SessionState::Handshaking(mid);
                        }
                        Err(HandshakeError::Failure(mid)) => {
                            warn!(
                                "Unable to handle incoming DTLS message from {}: {}",
                                peer,
                                mid.error()
                            );
                            drop_session = true;
                            failed = true;
                        }
                        Err(HandshakeError::SetupFailure(e)) => {
                            warn!("DTLS engine failure for {}: {}", peer, e);
                            drop_session = true;
                            failed = true;
                        }
                    },
                    other => session.state = other,
                }
            }

            let mut app_data = None;
            if !drop_session {
                if let SessionState::Established(stream) = &mut session.state {
                    let mut buf = vec![0u8; MAX_PLAINTEXT];
                    match stream.ssl_read(&mut buf) {
                        Ok(len) => {
                            buf.truncate(len);
                            app_data = Some(buf);
                        }
                        Err(e)
                            if e.code() == ErrorCode::WANT_READ
                                || e.code() == ErrorCode::WANT_WRITE =>
                        {
                            // handshake or control record without app payload
                            debug!("No application data in DTLS record from {}", peer);
                        }
                        Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                            debug!("DTLS peer {} closed the session", peer);
                            let _ = stream.shutdown();
                            drop_session = true;
                        }
                        Err(e) => {
                            warn!(
                                "Unable to handle incoming DTLS message from {}: {}",
                                peer, e
                            );
                            drop_session = true;
                            failed = true;
                        }
                    }
                }
            }

            (
                session.chan.clone(),
                app_data,
                newly_connected,
                drop_session,
                failed,
            )
        };

        // ship whatever the engine produced (flights, alerts, close_notify)
        self.flush_chan(&chan, peer).await;
        if drop_session {
            self.sessions.remove(&peer);
        }
        if failed {
            return (None, None, false);
        }
        match app_data {
            Some(data) => (Some(data), Some(peer), newly_connected),
            None => (None, None, newly_connected),
        }
    }

    /// Encrypt `msg` to `peer` and send it
    ///
    /// Requires an established session; otherwise the message is dropped
    /// with a warning and no ciphertext leaves the socket.
    pub async fn write(&mut self, msg: &[u8], peer: SocketAddr) {
        let chan = match self.sessions.get_mut(&peer) {
            Some(session) => match &mut session.state {
                SessionState::Established(stream) => {
                    if let Err(e) = stream.ssl_write(msg) {
                        warn!("Failed to encrypt {} bytes for {}: {}", msg.len(), peer, e);
                        return;
                    }
                    session.chan.clone()
                }
                _ => {
                    warn!("{} does not have an active session", peer);
                    return;
                }
            },
            None => {
                warn!("{} does not have an active session", peer);
                return;
            }
        };
        self.flush_chan(&chan, peer).await;
    }

    /// Drain queued ciphertext to the socket, pacing ServerHelloDone
    async fn flush_chan(&self, chan: &ChannelStream, peer: SocketAddr) {
        for datagram in chan.drain_outgoing() {
            if let Some(delay) = self.hello_done_delay {
                if contains_server_hello_done(&datagram) {
                    debug!("Delaying ServerHelloDone for {} by {:?}", peer, delay);
                    tokio::time::sleep(delay).await;
                }
            }
            if let Err(e) = self.socket.send_to(&datagram, peer).await {
                warn!("Failed to send DTLS record to {}: {}", peer, e);
            }
        }
    }
}

fn install_psk_callbacks(builder: &mut SslContextBuilder, identity: Vec<u8>, psk: Vec<u8>) {
    {
        let identity = identity.clone();
        let psk = psk.clone();
        builder.set_psk_server_callback(move |_ssl, client_identity, psk_out| {
            if client_identity != Some(identity.as_slice()) {
                warn!("Rejecting DTLS peer with unknown PSK identity");
                return Ok(0);
            }
            if psk_out.len() < psk.len() {
                return Ok(0);
            }
            psk_out[..psk.len()].copy_from_slice(&psk);
            Ok(psk.len())
        });
    }
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        if identity_out.len() < identity.len() + 1 || psk_out.len() < psk.len() {
            return Ok(0);
        }
        identity_out[..identity.len()].copy_from_slice(&identity);
        // the identity buffer wants a C string
        identity_out[identity.len()] = 0;
        psk_out[..psk.len()].copy_from_slice(&psk);
        Ok(psk.len())
    });
}

fn create_session(ctx: &SslContext, direction: Direction) -> ProxyResult<DtlsSession> {
    let chan = ChannelStream::default();
    let mut ssl = Ssl::new(ctx)?;
    ssl.set_mtu(DTLS_MTU)?;
    let state = match direction {
        Direction::Accept => ssl.accept(chan.clone()),
        Direction::Connect => ssl.connect(chan.clone()),
    };
    let state = match state {
        Ok(stream) => SessionState::Established(stream),
        Err(HandshakeError::WouldBlock(mid)) => SessionState::Handshaking(mid),
        Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
        Err(HandshakeError::Failure(mid)) => {
            return Err(crate::error::ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("DTLS handshake failed: {}", mid.error()),
            )))
        }
    };
    Ok(DtlsSession { chan, state })
}

/// Scan a datagram's DTLS records for a ServerHelloDone handshake message
fn contains_server_hello_done(datagram: &[u8]) -> bool {
    let mut offset = 0;
    while datagram.len() >= offset + RECORD_HEADER_LEN {
        let length = u16::from_be_bytes([datagram[offset + 11], datagram[offset + 12]]) as usize;
        let body = offset + RECORD_HEADER_LEN;
        if datagram[offset] == CONTENT_TYPE_HANDSHAKE
            && body < datagram.len()
            && datagram[body] == HANDSHAKE_SERVER_HELLO_DONE
        {
            return true;
        }
        offset = body + length;
    }
    false
}
