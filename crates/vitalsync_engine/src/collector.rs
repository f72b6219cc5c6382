//! Change collection.

use crate::anchor::{Anchor, AnchorToken};
use crate::error::SyncResult;
use crate::source::{DataSource, SourceChange};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use vitalsync_protocol::{DataTypeId, Record};

/// Everything collected for one data type in one pass.
#[derive(Debug, Clone)]
pub struct RecordSet {
    /// The data type.
    pub type_id: DataTypeId,
    /// Records to upload, in source order.
    pub records: Vec<Record>,
    /// Anchor to commit once every record has been delivered.
    pub anchor: AnchorToken,
    /// True when no anchor existed and every live sample was collected.
    pub full_export: bool,
    /// Number of deletions the source reported that were not forwarded.
    pub skipped_deletions: usize,
}

impl RecordSet {
    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there is nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Turns data source answers into [`RecordSet`]s.
pub struct ChangeCollector<D: DataSource> {
    source: Arc<D>,
}

impl<D: DataSource> ChangeCollector<D> {
    /// Creates a collector reading from `source`.
    pub fn new(source: Arc<D>) -> Self {
        Self { source }
    }

    /// Collects `type_id` from `anchor`, or performs a full export if there
    /// is none.
    ///
    /// Deletions are not propagated: a sample deleted within the delta is
    /// dropped together with any earlier upsert of it. When a sample appears
    /// several times, its last version is kept at its last position.
    pub fn collect(&self, type_id: &DataTypeId, anchor: Option<&Anchor>) -> SyncResult<RecordSet> {
        let since = anchor.map(|a| &a.token);
        let result = self.source.query(type_id, since)?;

        let mut deleted: HashSet<Uuid> = HashSet::new();
        let mut skipped_deletions = 0;
        for change in &result.changes {
            if let SourceChange::Deleted(id) = change {
                deleted.insert(*id);
                skipped_deletions += 1;
            }
        }

        // Walk backwards so the last version of a sample wins.
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut records: Vec<Record> = result
            .changes
            .into_iter()
            .rev()
            .filter_map(|change| match change {
                SourceChange::Upsert(record) => Some(record),
                SourceChange::Deleted(_) => None,
            })
            .filter(|record| !deleted.contains(&record.id) && seen.insert(record.id))
            .collect();
        records.reverse();

        let set = RecordSet {
            type_id: type_id.clone(),
            records,
            anchor: result.anchor,
            full_export: anchor.is_none(),
            skipped_deletions,
        };

        debug!(
            %type_id,
            records = set.len(),
            full_export = set.full_export,
            skipped_deletions,
            "collected"
        );
        Ok(set)
    }
}
