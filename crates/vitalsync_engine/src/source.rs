//! Data source abstraction.
//!
//! The data source is the on-device store of samples. It owns change
//! tracking: it hands out opaque anchors and answers "what changed since
//! this anchor". The engine never interprets anchor tokens.

use crate::anchor::AnchorToken;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use vitalsync_protocol::{DataTypeId, Record};

/// A single change reported by the data source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    /// A sample was added or changed.
    Upsert(Record),
    /// A sample was deleted.
    Deleted(Uuid),
}

/// Answer to a [`DataSource::query`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Changes in source order.
    pub changes: Vec<SourceChange>,
    /// New high-water mark covering every change returned.
    pub anchor: AnchorToken,
}

/// Callback invoked when a subscribed type changes.
pub type ChangeCallback = Arc<dyn Fn(&DataTypeId) + Send + Sync>;

/// Handle returned by [`DataSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The local store samples are read from.
pub trait DataSource: Send + Sync {
    /// Returns false if the device has no such store at all.
    fn is_available(&self) -> bool;

    /// Asks the user for read access to `types`. Returns the user's answer.
    fn request_authorization(&self, types: &[DataTypeId]) -> SyncResult<bool>;

    /// Returns changes for `type_id` since `since`, or every live sample when
    /// `since` is `None`.
    ///
    /// # Errors
    ///
    /// - [`SyncError::DataSourceUnavailable`] if this type cannot be read here
    /// - [`SyncError::DataSourceDenied`] if read access was revoked
    fn query(&self, type_id: &DataTypeId, since: Option<&AnchorToken>) -> SyncResult<QueryResult>;

    /// Registers `callback` to be invoked whenever `type_id` changes.
    fn subscribe(&self, type_id: &DataTypeId, callback: ChangeCallback) -> SyncResult<SubscriptionId>;

    /// Removes a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// An in-memory data source for testing.
///
/// Each type keeps an append-only change log; anchors are log positions.
/// Full exports replay the log into the set of live samples.
pub struct MemoryDataSource {
    logs: RwLock<HashMap<DataTypeId, Vec<SourceChange>>>,
    subscribers: RwLock<Vec<(SubscriptionId, DataTypeId, ChangeCallback)>>,
    next_subscription: AtomicU64,
    available: AtomicBool,
    authorized: AtomicBool,
    unavailable_types: RwLock<HashSet<DataTypeId>>,
    queries: RwLock<Vec<(DataTypeId, Option<AnchorToken>)>>,
}

impl MemoryDataSource {
    /// Creates an empty, available and authorized source.
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            available: AtomicBool::new(true),
            authorized: AtomicBool::new(true),
            unavailable_types: RwLock::new(HashSet::new()),
            queries: RwLock::new(Vec::new()),
        }
    }

    /// Adds a sample and notifies subscribers of `type_id`.
    pub fn add(&self, type_id: impl Into<DataTypeId>, record: Record) {
        let type_id = type_id.into();
        self.push(&type_id, SourceChange::Upsert(record));
        self.notify(&type_id);
    }

    /// Adds several samples with a single notification.
    pub fn add_all(&self, type_id: impl Into<DataTypeId>, records: impl IntoIterator<Item = Record>) {
        let type_id = type_id.into();
        for record in records {
            self.push(&type_id, SourceChange::Upsert(record));
        }
        self.notify(&type_id);
    }

    /// Deletes a sample and notifies subscribers of `type_id`.
    pub fn delete(&self, type_id: impl Into<DataTypeId>, id: Uuid) {
        let type_id = type_id.into();
        self.push(&type_id, SourceChange::Deleted(id));
        self.notify(&type_id);
    }

    /// Sets whether the store exists on this device.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Grants or revokes read access.
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Makes queries for `type_id` fail with `DataSourceUnavailable`.
    pub fn set_type_unavailable(&self, type_id: impl Into<DataTypeId>, unavailable: bool) {
        let type_id = type_id.into();
        let mut types = self.unavailable_types.write();
        if unavailable {
            types.insert(type_id);
        } else {
            types.remove(&type_id);
        }
    }

    /// Returns every query received so far, with the anchor it carried.
    pub fn queries(&self) -> Vec<(DataTypeId, Option<AnchorToken>)> {
        self.queries.read().clone()
    }

    /// Forgets the recorded queries.
    pub fn clear_queries(&self) {
        self.queries.write().clear();
    }

    /// Returns the number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn push(&self, type_id: &DataTypeId, change: SourceChange) {
        self.logs
            .write()
            .entry(type_id.clone())
            .or_default()
            .push(change);
    }

    fn notify(&self, type_id: &DataTypeId) {
        // Callbacks run outside the lock so they may call back into the source.
        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, t, _)| t == type_id)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(type_id);
        }
    }
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for MemoryDataSource {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn request_authorization(&self, _types: &[DataTypeId]) -> SyncResult<bool> {
        if !self.is_available() {
            return Err(SyncError::AuthorizationDenied(
                "data source not available on this device".into(),
            ));
        }
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    fn query(&self, type_id: &DataTypeId, since: Option<&AnchorToken>) -> SyncResult<QueryResult> {
        self.queries.write().push((type_id.clone(), since.cloned()));

        if !self.authorized.load(Ordering::SeqCst) {
            return Err(SyncError::DataSourceDenied("read access revoked".into()));
        }
        if !self.is_available() || self.unavailable_types.read().contains(type_id) {
            return Err(SyncError::DataSourceUnavailable {
                type_id: type_id.clone(),
                message: "type not supported on this device".into(),
            });
        }

        let logs = self.logs.read();
        let log = logs.get(type_id).map(Vec::as_slice).unwrap_or(&[]);

        let changes = match since {
            Some(token) => {
                let position: usize = token.as_str().parse().map_err(|_| {
                    SyncError::DataSourceUnavailable {
                        type_id: type_id.clone(),
                        message: format!("unrecognized anchor {token}"),
                    }
                })?;
                log.get(position.min(log.len())..)
                    .unwrap_or(&[])
                    .to_vec()
            }
            None => {
                let mut live: Vec<Record> = Vec::new();
                for change in log {
                    match change {
                        SourceChange::Upsert(record) => {
                            match live.iter_mut().find(|r| r.id == record.id) {
                                Some(existing) => *existing = record.clone(),
                                None => live.push(record.clone()),
                            }
                        }
                        SourceChange::Deleted(id) => live.retain(|r| r.id != *id),
                    }
                }
                live.into_iter().map(SourceChange::Upsert).collect()
            }
        };

        Ok(QueryResult {
            changes,
            anchor: AnchorToken::new(log.len().to_string()),
        })
    }

    fn subscribe(&self, type_id: &DataTypeId, callback: ChangeCallback) -> SyncResult<SubscriptionId> {
        if !self.is_available() {
            return Err(SyncError::DataSourceUnavailable {
                type_id: type_id.clone(),
                message: "cannot observe an unavailable store".into(),
            });
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .push((id, type_id.clone(), callback));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sub, _, _)| *sub != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(value: f64) -> Record {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Record::new(value, "count", t, t)
    }

    #[test]
    fn full_query_returns_live_samples() {
        let source = MemoryDataSource::new();
        let keep = record(1.0);
        let gone = record(2.0);
        source.add("steps", keep.clone());
        source.add("steps", gone.clone());
        source.delete("steps", gone.id);

        let result = source.query(&"steps".into(), None).unwrap();
        assert_eq!(result.changes, vec![SourceChange::Upsert(keep)]);
        assert_eq!(result.anchor.as_str(), "3");
    }

    #[test]
    fn delta_query_returns_changes_since_anchor() {
        let source = MemoryDataSource::new();
        source.add("steps", record(1.0));
        let first = source.query(&"steps".into(), None).unwrap();

        let later = record(2.0);
        source.add("steps", later.clone());
        let delta = source.query(&"steps".into(), Some(&first.anchor)).unwrap();

        assert_eq!(delta.changes, vec![SourceChange::Upsert(later)]);
        assert_eq!(delta.anchor.as_str(), "2");
    }

    #[test]
    fn query_errors() {
        let source = MemoryDataSource::new();
        source.set_type_unavailable("ecg", true);
        assert!(matches!(
            source.query(&"ecg".into(), None),
            Err(SyncError::DataSourceUnavailable { .. })
        ));

        source.set_authorized(false);
        assert!(matches!(
            source.query(&"steps".into(), None),
            Err(SyncError::DataSourceDenied(_))
        ));
        assert_eq!(source.queries().len(), 2);
    }

    #[test]
    fn subscribers_are_notified() {
        let source = MemoryDataSource::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);

        let id = source
            .subscribe(
                &"steps".into(),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        source.add("steps", record(1.0));
        source.add("heart_rate", record(60.0));
        source.add_all("steps", [record(2.0), record(3.0)]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        source.unsubscribe(id);
        source.add("steps", record(4.0));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(source.subscription_count(), 0);
    }
}
