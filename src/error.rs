//! Error types for the DNS proxy

#![allow(dead_code)]

use thiserror::Error;

/// Main error type for the proxy core
///
/// Construction-time failures are fatal and bubble up to the CLI; runtime
/// upstream failures never appear here because they are converted into
/// SERVFAIL responses on the serving side.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("unsupported upstream transport: {0}")]
    InvalidTransport(String),

    #[error("invalid {rtype} record address: {value}")]
    InvalidAddress { rtype: &'static str, value: String },

    #[error("DTLS credential option '{0}' not found")]
    MissingCredential(&'static str),

    #[error("{0} is only supported on Linux")]
    UnsupportedPlatform(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("DNS message error: {0}")]
    Dns(#[from] hickory_proto::ProtoError),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the proxy core
pub type ProxyResult<T> = Result<T, ProxyError>;
