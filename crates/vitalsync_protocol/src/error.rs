//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding upload payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record cannot be represented on the wire.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
