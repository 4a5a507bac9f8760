//! Error types for the server framework.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the framework.
///
/// Per-connection failures (`Protocol`, `Io`, timeouts) terminate only the
/// connection they occurred on; the server logs them and keeps accepting.
#[derive(Debug, Error)]
pub enum Error {
    /// Programmer error at an API boundary: wrong message type requested,
    /// a response written with a mismatched message ID, or a TLS upgrade
    /// requested on an already-secured connection.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Malformed BER: unexpected tag, bad length encoding, truncated value.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client sent an operation the framework does not route.
    #[error("unsupported operation: tag 0x{0:02X}")]
    UnsupportedOperation(u8),

    /// Invariant violation inside the framework.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation on a connection or server that has already shut down.
    #[error("connection closed")]
    Closed,

    /// Transport-level I/O failure, including read/write deadline expiry.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or configuration failure.
    #[error("tls error: {0}")]
    Tls(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }
}
