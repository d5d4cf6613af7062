//! Error types for murmur-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// murmur-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// PSI-Ca parameter failure: invalid group element, empty reply, or an
    /// item too large to re-canonicalize.
    #[error("invalid PSI input: {0}")]
    InvalidInput(String),

    /// Hash or group-arithmetic initialization failure (e.g. rejected a
    /// sampled exponent of 0 or 1 after too many retries).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// JSON (de)serialization error for wire envelopes.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
