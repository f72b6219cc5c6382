//! Error types for the sync engine.

use thiserror::Error;
use vitalsync_protocol::{DataTypeId, ProtocolError};
use vitalsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Endpoint, token or tracked types are missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The user declined read access to the data source.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The data source cannot serve this data type on this device.
    #[error("data source unavailable for {type_id}: {message}")]
    DataSourceUnavailable {
        /// Affected data type.
        type_id: DataTypeId,
        /// Error message.
        message: String,
    },

    /// Read access to the data source was revoked.
    #[error("data source access denied: {0}")]
    DataSourceDenied(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server failed with a transient status (5xx, 408, 429).
    #[error("server error: HTTP {status}")]
    ServerError {
        /// HTTP status code.
        status: u16,
    },

    /// The server refused the body size.
    #[error("payload too large for a batch of {records} records; lower records_per_chunk")]
    PayloadTooLarge {
        /// Number of records in the refused batch.
        records: usize,
    },

    /// The bearer token was rejected (401/403).
    #[error("bearer token rejected: HTTP {status}")]
    TokenRejected {
        /// HTTP status code.
        status: u16,
    },

    /// The server permanently rejected a batch (other 4xx).
    #[error("batch rejected by server: HTTP {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// Anchor persistence failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// A batch could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

/// Coarse classification of a [`SyncError`], carried in reports and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncErrorKind {
    /// See [`SyncError::Configuration`].
    Configuration,
    /// See [`SyncError::AuthorizationDenied`].
    AuthorizationDenied,
    /// See [`SyncError::DataSourceUnavailable`].
    DataSourceUnavailable,
    /// See [`SyncError::DataSourceDenied`].
    DataSourceDenied,
    /// Transport failures, timeouts and transient server statuses.
    TransportTransient,
    /// Non-retryable transport failures.
    TransportFatal,
    /// See [`SyncError::PayloadTooLarge`].
    PayloadTooLarge,
    /// See [`SyncError::TokenRejected`].
    TokenRejected,
    /// See [`SyncError::Rejected`].
    Rejected,
    /// See [`SyncError::Persistence`].
    Persistence,
    /// See [`SyncError::Protocol`].
    Protocol,
    /// See [`SyncError::Cancelled`].
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error aborts the whole session.
    ///
    /// Everything else only stops the affected data types from advancing.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthorizationDenied(_)
                | SyncError::DataSourceDenied(_)
                | SyncError::TokenRejected { .. }
        )
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Configuration(_) => SyncErrorKind::Configuration,
            SyncError::AuthorizationDenied(_) => SyncErrorKind::AuthorizationDenied,
            SyncError::DataSourceUnavailable { .. } => SyncErrorKind::DataSourceUnavailable,
            SyncError::DataSourceDenied(_) => SyncErrorKind::DataSourceDenied,
            SyncError::Transport {
                retryable: false, ..
            } => SyncErrorKind::TransportFatal,
            SyncError::Transport { .. } | SyncError::ServerError { .. } | SyncError::Timeout => {
                SyncErrorKind::TransportTransient
            }
            SyncError::PayloadTooLarge { .. } => SyncErrorKind::PayloadTooLarge,
            SyncError::TokenRejected { .. } => SyncErrorKind::TokenRejected,
            SyncError::Rejected { .. } => SyncErrorKind::Rejected,
            SyncError::Persistence(_) => SyncErrorKind::Persistence,
            SyncError::Protocol(_) => SyncErrorKind::Protocol,
            SyncError::Cancelled => SyncErrorKind::Cancelled,
        }
    }
}
