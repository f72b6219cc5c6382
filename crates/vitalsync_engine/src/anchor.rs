//! Durable per-endpoint, per-type cursors.

use crate::endpoint::EndpointKey;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vitalsync_protocol::DataTypeId;
use vitalsync_storage::{KeyValueStore, StorageError};

const ANCHOR_PREFIX: &str = "anchors";

/// Opaque change-tracking cursor issued by the data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorToken(String);

impl AnchorToken {
    /// Wraps a token produced by a data source.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// The cursor to resume from.
    pub token: AnchorToken,
    /// When the anchor was last committed.
    pub updated_at: DateTime<Utc>,
}

/// Anchor persistence on top of a [`KeyValueStore`].
///
/// Keys have the form `anchors/<endpoint-key>/<type-id>`, so every endpoint
/// owns a disjoint key range.
///
/// Reads take a shared lock and `commit`/`reset_all` an exclusive one: a
/// reader never observes a half-finished reset.
pub struct AnchorStore {
    store: Arc<dyn KeyValueStore>,
    lock: RwLock<()>,
}

impl AnchorStore {
    /// Creates an anchor store over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: RwLock::new(()),
        }
    }

    /// Returns the anchor for `(endpoint, type_id)`.
    ///
    /// Storage failures and undecodable values are logged and reported as
    /// "no anchor", which makes the next collection a full export.
    pub fn get(&self, endpoint: &EndpointKey, type_id: &DataTypeId) -> Option<Anchor> {
        let _guard = self.lock.read();
        let key = anchor_key(endpoint, type_id);

        let bytes = match self.store.get(&key) {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(%endpoint, %type_id, error = %e, "anchor read failed; falling back to full export");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(anchor) => Some(anchor),
            Err(e) => {
                warn!(%endpoint, %type_id, error = %e, "stored anchor is corrupt; falling back to full export");
                None
            }
        }
    }

    /// Replaces the anchor for `(endpoint, type_id)`.
    ///
    /// The store's `set` is atomic, so on error the previous anchor is still
    /// in place.
    pub fn commit(
        &self,
        endpoint: &EndpointKey,
        type_id: &DataTypeId,
        token: &AnchorToken,
    ) -> SyncResult<Anchor> {
        let anchor = Anchor {
            token: token.clone(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&anchor)
            .map_err(|e| StorageError::Corrupted(format!("cannot encode anchor: {e}")))?;

        let _guard = self.lock.write();
        self.store.set(&anchor_key(endpoint, type_id), &bytes)?;
        debug!(%endpoint, %type_id, token = %token, "anchor committed");
        Ok(anchor)
    }

    /// Deletes every anchor stored for `endpoint`. Returns how many were removed.
    pub fn reset_all(&self, endpoint: &EndpointKey) -> SyncResult<usize> {
        let _guard = self.lock.write();
        let keys = self.store.keys_with_prefix(&endpoint_prefix(endpoint))?;

        let mut removed = 0;
        for key in &keys {
            if self.store.delete(key)? {
                removed += 1;
            }
        }

        info!(%endpoint, removed, "anchors reset");
        Ok(removed)
    }

    /// Lists the anchors stored for `endpoint`, ordered by type id.
    pub fn list(&self, endpoint: &EndpointKey) -> SyncResult<Vec<(DataTypeId, Anchor)>> {
        let _guard = self.lock.read();
        let prefix = endpoint_prefix(endpoint);

        let mut anchors = Vec::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            let anchor: Anchor = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupted(format!("anchor {key}: {e}")))?;
            anchors.push((DataTypeId::new(&key[prefix.len()..]), anchor));
        }
        Ok(anchors)
    }
}

fn endpoint_prefix(endpoint: &EndpointKey) -> String {
    format!("{ANCHOR_PREFIX}/{endpoint}/")
}

fn anchor_key(endpoint: &EndpointKey, type_id: &DataTypeId) -> String {
    format!("{}{type_id}", endpoint_prefix(endpoint))
}
