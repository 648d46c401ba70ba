//! Error types for the proxy.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed DNS wire data
    #[error("DNS decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The hosts override source could not be read
    #[error("failed to load hosts file {}: {source}", path.display())]
    Hosts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a DNS message failed to decode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid label at offset {0}")]
    BadLabel(usize),

    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),

    #[error("domain name exceeds 255 bytes")]
    NameTooLong,

    #[error("record data does not match its declared type")]
    BadRdata,
}
