//! Record files as a data source.
//!
//! A record file is a JSON object mapping type ids to arrays of records in
//! wire shape. Records are treated as append-only: an anchor is the number
//! of records of that type already delivered, so appending to an array and
//! pushing again uploads only the new tail.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};
use vitalsync_engine::{
    AnchorToken, ChangeCallback, DataSource, QueryResult, SourceChange, SubscriptionId, SyncError,
    SyncResult,
};
use vitalsync_protocol::{DataTypeId, ProtocolError, Record};

/// Errors raised while loading a record file.
#[derive(Debug, Error)]
pub enum RecordFileError {
    /// The file could not be read.
    #[error("cannot read {path:?}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a map of record arrays.
    #[error("invalid record file {path:?}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// A record cannot be represented on the wire.
    #[error("invalid {type_id} record at index {index}: {source}")]
    InvalidRecord {
        /// Type of the record.
        type_id: DataTypeId,
        /// Position in the type's array.
        index: usize,
        /// Underlying error.
        source: ProtocolError,
    },
}

/// A [`DataSource`] backed by a record file loaded once at startup.
pub struct FileDataSource {
    records: BTreeMap<DataTypeId, Vec<Record>>,
    next_subscription: AtomicU64,
}

impl FileDataSource {
    /// Reads and validates the record file at `path`.
    pub fn load(path: &Path) -> Result<Self, RecordFileError> {
        let bytes = fs::read(path).map_err(|source| RecordFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes).map_err(|e| match e {
            RecordFileError::Parse { source, .. } => RecordFileError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses a record file from memory.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecordFileError> {
        let records: BTreeMap<DataTypeId, Vec<Record>> =
            serde_json::from_slice(bytes).map_err(|source| RecordFileError::Parse {
                path: PathBuf::new(),
                source,
            })?;

        for (type_id, list) in &records {
            for (index, record) in list.iter().enumerate() {
                record
                    .validate()
                    .map_err(|source| RecordFileError::InvalidRecord {
                        type_id: type_id.clone(),
                        index,
                        source,
                    })?;
            }
        }

        Ok(Self {
            records,
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Returns the type ids present in the file.
    pub fn type_ids(&self) -> Vec<DataTypeId> {
        self.records.keys().cloned().collect()
    }

    /// Returns the total number of records in the file.
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

impl DataSource for FileDataSource {
    fn is_available(&self) -> bool {
        true
    }

    fn request_authorization(&self, _types: &[DataTypeId]) -> SyncResult<bool> {
        Ok(true)
    }

    fn query(&self, type_id: &DataTypeId, since: Option<&AnchorToken>) -> SyncResult<QueryResult> {
        let list = self.records.get(type_id).map(Vec::as_slice).unwrap_or_default();

        let mut start = match since {
            None => 0,
            Some(token) => token.as_str().parse::<usize>().map_err(|_| {
                SyncError::DataSourceUnavailable {
                    type_id: type_id.clone(),
                    message: format!("anchor {token} is not a record position"),
                }
            })?,
        };
        if start > list.len() {
            warn!(
                type_id = %type_id,
                anchor = start,
                records = list.len(),
                "record file shrank below the stored anchor; sending every record"
            );
            start = 0;
        }

        debug!(type_id = %type_id, from = start, to = list.len(), "record file query");
        Ok(QueryResult {
            changes: list[start..]
                .iter()
                .cloned()
                .map(SourceChange::Upsert)
                .collect(),
            anchor: AnchorToken::new(list.len().to_string()),
        })
    }

    // The file does not change while the process runs; subscriptions never fire.
    fn subscribe(&self, _type_id: &DataTypeId, _callback: ChangeCallback) -> SyncResult<SubscriptionId> {
        Ok(SubscriptionId(
            self.next_subscription.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}
