//! Error types for fah-client.
//!
//! Mirrors the error-kind taxonomy from the design: transient transport,
//! terminal server rejection, integrity failure, kernel failure, and local
//! environment errors all get their own variant so callers can match on kind
//! without string-sniffing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FahError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("kernel failure: {0}")]
    Kernel(String),

    #[error("local environment error: {0}")]
    Environment(String),

    #[error("replay detected: {0}")]
    Replay(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FahError>;
