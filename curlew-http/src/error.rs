use std::io;
use std::net::SocketAddr;

use curlew::TransferError;

/// Errors produced by the HTTP engine.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The connection was closed before the response was complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid URL or unsupported scheme.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Host name did not resolve.
    #[error("could not resolve host: {0}")]
    Resolve(String),

    /// Every resolved address refused or failed the connect.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Response parsing error.
    #[error("parse error: {0}")]
    Parse(&'static str),

    /// Connect or total deadline passed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// `https` requested from a build without TLS support.
    #[error("tls support not compiled in")]
    TlsUnavailable,

    /// Protocol error (unexpected event, bad state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed cookie line.
    #[error("cookie parse error: {0}")]
    Cookie(String),
}

impl From<HttpError> for TransferError {
    fn from(err: HttpError) -> Self {
        TransferError::new(err.to_string())
    }
}
