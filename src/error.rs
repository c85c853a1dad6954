//! Error types for the proxy pipeline.

use std::io;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while proxying a connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed (bad key size, authentication failure, ...)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Decryption attempted while a preliminary key awaits diversification
    #[error("unable to decrypt while key diversification is pending")]
    KeyDiversificationPending,

    /// Malformed frame or protocol message
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Handshake protocol error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// SOCKS5 command that is recognized but not served
    #[error("command not supported: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Unknown address type in a request header
    #[error("address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Name resolution failed
    #[error("resolve error: {0}")]
    Resolve(String),

    /// Connect or handshake timeout
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Operation on a closed stream or stopped server
    #[error("closed")]
    Closed,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new malformed-message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Transitional cipher state: the caller may retry once the key is final.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, Error::KeyDiversificationPending)
    }

    /// Check if this error is transient rather than connection-fatal
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Network(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// SOCKS5 `REP` code reported to the client for this failure.
    pub fn socks5_reply_code(&self) -> u8 {
        match self {
            Error::UnsupportedCommand(_) => 0x07,
            Error::UnsupportedAddressType(_) => 0x08,
            Error::Resolve(_) | Error::Timeout(_) => 0x04,
            Error::Network(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => 0x05,
                io::ErrorKind::TimedOut => 0x04,
                io::ErrorKind::AddrNotAvailable => 0x03,
                _ => 0x01,
            },
            _ => 0x01,
        }
    }
}
