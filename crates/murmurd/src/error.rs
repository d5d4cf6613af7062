//! Error taxonomy for the exchange protocol
//!
//! Propagation rule: within a session, any error terminates that session
//! and surfaces one typed error to the scheduler. The scheduler converts it
//! to a history update (increment `attempts`, `consecutive_failures`) and a
//! telemetry event; it never propagates to the UI. Merge-time errors are
//! fail-soft (the offending message is skipped); tombstone and dedup
//! rejections are not errors at all. See [`murmur-core`]'s store return
//! values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Malformed wire payload, bad length prefix, non-UTF-8, missing key.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// PSI parameter failure, hash initialization failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Connect timeout, reset, unreachable peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// Trust insufficient, session state mismatch.
    #[error("protocol aborted: {0}")]
    ProtocolAbort(String),

    /// Session or whole-cycle deadline exceeded.
    #[error("timeout")]
    Timeout,

    /// Too many inbound sessions.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invariant violation: a bug, not a peer misbehaving.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<murmur_core::Error> for ExchangeError {
    fn from(err: murmur_core::Error) -> Self {
        match err {
            murmur_core::Error::InvalidInput(msg) => ExchangeError::InvalidInput(msg),
            murmur_core::Error::Crypto(msg) => ExchangeError::Crypto(msg),
            murmur_core::Error::Serialization(e) => ExchangeError::InvalidInput(e.to_string()),
        }
    }
}

impl From<murmur_net::TransportError> for ExchangeError {
    fn from(err: murmur_net::TransportError) -> Self {
        ExchangeError::Transport(err.to_string())
    }
}

impl From<murmur_net::FrameError> for ExchangeError {
    fn from(err: murmur_net::FrameError) -> Self {
        ExchangeError::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::InvalidInput(err.to_string())
    }
}

impl From<StorageError> for ExchangeError {
    fn from(err: StorageError) -> Self {
        ExchangeError::Internal(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
