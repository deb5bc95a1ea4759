//! Error types shared across magent crates.

use thiserror::Error;

/// Result alias used across all magent crates.
pub type MagentResult<T> = Result<T, MagentError>;

/// Top-level error type for magent operations.
#[derive(Error, Debug)]
pub enum MagentError {
    /// Invalid or missing configuration; fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Transport-level failure talking to containerd or a shim.
    #[error("network error: {0}")]
    Network(String),

    /// Containerd metadata or event service call failed.
    #[error("containerd error: {0}")]
    Containerd(String),

    /// Malformed payload: exposition text, OCI spec, or event body.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invariant violation inside the agent (poisoned lock, bad state).
    #[error("internal error: {0}")]
    Internal(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
