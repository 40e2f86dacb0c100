//! Upstream DNS client
//!
//! Resolves wire-format DNS queries against the single configured upstream
//! server. Supports UDP with a bounded retry window, plain TCP, and UDP with
//! fallback to TCP on truncation. Any upstream failure is converted into a
//! locally synthesized SERVFAIL response so that a misbehaving upstream never
//! terminates a client-facing connection.

#![allow(dead_code)]

use std::cmp;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

/// Overall time budget for a query when the caller gives none
const DEFAULT_LIFETIME: Duration = Duration::from_secs(5);
/// Upper bound for a single UDP attempt inside the retry window
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// TTL used for answers synthesized by the mock upstream
const MOCK_TTL: u32 = 300;

/// Transports towards the upstream DNS server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Standard UDP DNS
    Udp,
    /// UDP first, retry over TCP when the response is truncated
    #[serde(rename = "udp+tcp")]
    UdpTcpFallback,
    /// Plain TCP DNS
    Tcp,
}

impl Transport {
    /// Parse from string
    pub fn from_str(s: &str) -> ProxyResult<Self> {
        match s {
            "udp" => Ok(Transport::Udp),
            "udp+tcp" => Ok(Transport::UdpTcpFallback),
            "tcp" => Ok(Transport::Tcp),
            other => Err(ProxyError::InvalidTransport(other.to_string())),
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::UdpTcpFallback => "udp+tcp",
            Transport::Tcp => "tcp",
        }
    }

    /// Get the default upstream port for this transport
    pub fn default_port(&self) -> u16 {
        53
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trait for upstream resolvers
///
/// Servers hold the upstream behind `Arc<dyn Upstream>`; the client below
/// talks to the network, the mock answers from fixed addresses.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolve a wire-format query into a wire-format response
    async fn query(&self, wire: &[u8], timeout: Option<Duration>) -> ProxyResult<Vec<u8>>;
}

/// Client for the proxied upstream DNS server
///
/// Owns no sockets; each query opens its transport on demand.
pub struct DnsUpstream {
    host: String,
    port: u16,
    transport: Transport,
}

impl DnsUpstream {
    /// Create a new upstream descriptor
    pub fn new(host: impl Into<String>, port: Option<u16>, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port: port.unwrap_or_else(|| transport.default_port()),
            transport,
        }
    }

    /// Get the upstream port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve the configured host to a socket address, preferring IPv4
    async fn resolve_addr(&self) -> ProxyResult<SocketAddr> {
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port)).await?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses found for {}", self.host),
                ))
            })
    }

    /// Single UDP exchange bounded by `per_attempt`
    ///
    /// Responses from the wrong peer or with an unexpected transaction id are
    /// ignored and the attempt keeps listening until its deadline.
    async fn udp_attempt(
        &self,
        wire: &[u8],
        expected_id: u16,
        addr: SocketAddr,
        per_attempt: Duration,
    ) -> ProxyResult<Message> {
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            (IpAddr::from(Ipv6Addr::UNSPECIFIED), 0).into()
        } else {
            (IpAddr::from(Ipv4Addr::UNSPECIFIED), 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(wire, addr).await?;

        let mut buf = vec![0u8; 4096];
        tokio::time::timeout(per_attempt, async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from != addr {
                    debug!("Ignoring datagram from unexpected peer {}", from);
                    continue;
                }
                let response = Message::from_bytes(&buf[..len])?;
                if response.id() != expected_id {
                    debug!(
                        "Ignoring response with unexpected id {} (want {})",
                        response.id(),
                        expected_id
                    );
                    continue;
                }
                return Ok(response);
            }
        })
        .await
        .map_err(|_| timeout_error())?
    }

    /// UDP query with a retry loop bounded by `lifetime`
    async fn query_udp(
        &self,
        query: &Message,
        addr: SocketAddr,
        lifetime: Option<Duration>,
    ) -> ProxyResult<Message> {
        let lifetime = lifetime.unwrap_or(DEFAULT_LIFETIME);
        let wire = query.to_bytes()?;
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= lifetime {
                return Err(timeout_error());
            }
            let per_attempt = cmp::min(lifetime - elapsed, DEFAULT_TIMEOUT);
            match self.udp_attempt(&wire, query.id(), addr, per_attempt).await {
                Err(e) if is_timeout(&e) => continue,
                other => return other,
            }
        }
    }

    /// One TCP exchange with the standard two-byte length prefix
    async fn query_tcp(
        &self,
        query: &Message,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> ProxyResult<Message> {
        let limit = timeout.unwrap_or(DEFAULT_LIFETIME);
        let wire = query.to_bytes()?;
        tokio::time::timeout(limit, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
            stream.write_all(&wire).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u16::from_be_bytes(len_buf) as usize;
            let mut response = vec![0u8; response_len];
            stream.read_exact(&mut response).await?;
            Ok(Message::from_bytes(&response)?)
        })
        .await
        .map_err(|_| timeout_error())?
    }

    /// UDP first; a truncated response triggers one TCP retry
    async fn query_udp_tcp(
        &self,
        query: &Message,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> ProxyResult<Message> {
        let response = self.query_udp(query, addr, timeout).await?;
        if response.truncated() {
            debug!("Truncated UDP response from {}, retrying over TCP", addr);
            return self.query_tcp(query, addr, timeout).await;
        }
        Ok(response)
    }

    async fn exchange(&self, query: &Message, timeout: Option<Duration>) -> ProxyResult<Message> {
        let addr = self.resolve_addr().await?;
        match self.transport {
            Transport::Udp => self.query_udp(query, addr, timeout).await,
            Transport::Tcp => self.query_tcp(query, addr, timeout).await,
            Transport::UdpTcpFallback => self.query_udp_tcp(query, addr, timeout).await,
        }
    }
}

#[async_trait]
impl Upstream for DnsUpstream {
    async fn query(&self, wire: &[u8], timeout: Option<Duration>) -> ProxyResult<Vec<u8>> {
        let mut query = Message::from_bytes(wire)?;
        let original_id = query.id();
        if original_id == 0 {
            // A zero id is valid on the client side but too easy to spoof
            // towards the upstream; send a fresh one and restore it below.
            query.set_id(random_id());
        }

        let mut response = match self.exchange(&query, timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Upstream query to {}:{} via {} failed: {}",
                    self.host, self.port, self.transport, e
                );
                servfail_response(&query)
            }
        };
        response.set_id(original_id);
        Ok(response.to_bytes()?)
    }
}

/// Build a SERVFAIL response echoing the query's question section
fn servfail_response(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);
    for question in query.queries() {
        response.add_query(question.clone());
    }
    response
}

/// Mint a nonzero 16-bit transaction id
fn random_id() -> u16 {
    loop {
        let id = rand::random::<u16>();
        if id != 0 {
            return id;
        }
    }
}

fn timeout_error() -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "upstream query timed out",
    ))
}

fn is_timeout(e: &ProxyError) -> bool {
    matches!(e, ProxyError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut)
}

/// Address supplied to the mock upstream, either as text or raw bytes
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AddressSpec {
    Text(String),
    Raw(Vec<u8>),
}

impl AddressSpec {
    fn to_ipv4(&self) -> ProxyResult<Ipv4Addr> {
        match self {
            AddressSpec::Text(s) => s.parse().map_err(|_| ProxyError::InvalidAddress {
                rtype: "A",
                value: s.clone(),
            }),
            AddressSpec::Raw(bytes) => <[u8; 4]>::try_from(bytes.as_slice())
                .map(Ipv4Addr::from)
                .map_err(|_| ProxyError::InvalidAddress {
                    rtype: "A",
                    value: format!("{bytes:?}"),
                }),
        }
    }

    fn to_ipv6(&self) -> ProxyResult<Ipv6Addr> {
        match self {
            AddressSpec::Text(s) => s.parse().map_err(|_| ProxyError::InvalidAddress {
                rtype: "AAAA",
                value: s.clone(),
            }),
            AddressSpec::Raw(bytes) => <[u8; 16]>::try_from(bytes.as_slice())
                .map(Ipv6Addr::from)
                .map_err(|_| ProxyError::InvalidAddress {
                    rtype: "AAAA",
                    value: format!("{bytes:?}"),
                }),
        }
    }
}

/// Upstream substitute answering from fixed addresses
///
/// Answers class-IN A and AAAA questions with the configured addresses;
/// every other question is echoed back with an empty answer section. Never
/// touches the network.
pub struct MockDnsUpstream {
    a: Option<Ipv4Addr>,
    aaaa: Option<Ipv6Addr>,
}

impl MockDnsUpstream {
    /// Create a mock upstream from configured address specs
    pub fn new(a: Option<&AddressSpec>, aaaa: Option<&AddressSpec>) -> ProxyResult<Self> {
        Ok(Self {
            a: a.map(AddressSpec::to_ipv4).transpose()?,
            aaaa: aaaa.map(AddressSpec::to_ipv6).transpose()?,
        })
    }

    /// Get the configured A record address
    pub fn a(&self) -> Option<Ipv4Addr> {
        self.a
    }

    /// Get the configured AAAA record address
    pub fn aaaa(&self) -> Option<Ipv6Addr> {
        self.aaaa
    }
}

#[async_trait]
impl Upstream for MockDnsUpstream {
    async fn query(&self, wire: &[u8], _timeout: Option<Duration>) -> ProxyResult<Vec<u8>> {
        let query = Message::from_bytes(wire)?;
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(query.op_code())
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);
        for question in query.queries() {
            response.add_query(question.clone());
            if question.query_class() != DNSClass::IN {
                continue;
            }
            match question.query_type() {
                RecordType::A => {
                    if let Some(addr) = self.a {
                        response.add_answer(Record::from_rdata(
                            question.name().clone(),
                            MOCK_TTL,
                            RData::A(A::from(addr)),
                        ));
                    }
                }
                RecordType::AAAA => {
                    if let Some(addr) = self.aaaa {
                        response.add_answer(Record::from_rdata(
                            question.name().clone(),
                            MOCK_TTL,
                            RData::AAAA(AAAA::from(addr)),
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(response.to_bytes()?)
    }
}
