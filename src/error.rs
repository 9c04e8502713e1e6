//! Error types shared across the client.

use std::io::ErrorKind;

use thiserror::Error;

/// Result alias used throughout the library surface.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the protocol engines.
///
/// Per-connection failures terminate only that connection or session;
/// `Configuration` failures are fatal before serving.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("socks5: unsupported version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("socks5: invalid methods count")]
    InvalidMethodsCount,

    #[error("socks5: unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("socks5: no acceptable authentication methods")]
    NoAcceptableMethods,

    #[error("malformed address: {0}")]
    MalformedAddress(&'static str),

    #[error("invalid key size: expected {expected} bytes, got {got}")]
    InvalidKeySize { expected: usize, got: usize },

    #[error("unsupported cipher method")]
    UnsupportedCipher,

    #[error("header type mismatch: expected {expected:#04x}, got {got:#04x}")]
    HeaderTypeMismatch { expected: u8, got: u8 },

    #[error("timestamp skewed by {0} seconds")]
    TimestampSkew(u64),

    #[error("request salt mismatch")]
    SaltMismatch,

    #[error("aead open failed")]
    AeadOpenFailed,

    #[error("aead seal failed")]
    AeadSealFailed,

    #[error("packet too short: need {need} bytes, got {got}")]
    PacketTooShort { need: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// True for terminations that are part of a normal connection
    /// lifecycle (peer went away, socket closed under us, shutdown).
    /// Callers log these at debug instead of warn.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
