//! Splitting record sets into upload batches.

use crate::collector::RecordSet;
use crate::error::SyncResult;
use vitalsync_protocol::{encode_batch, DataTypeId, Record};

/// Records of one type inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// The data type.
    pub type_id: DataTypeId,
    /// A contiguous run of that type's records.
    pub records: Vec<Record>,
}

/// A bounded, wire-ready group of records.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    /// Position of this batch in the session, from 0.
    pub index: usize,
    /// Per-type record runs, in collection order.
    pub entries: Vec<BatchEntry>,
    /// Whether these records come from a full export.
    pub full_export: bool,
    /// Types whose last record of the session is in this batch. A type's
    /// anchor may be committed once this batch is accepted.
    pub drains: Vec<DataTypeId>,
}

impl UploadBatch {
    fn new(index: usize, full_export: bool) -> Self {
        Self {
            index,
            entries: Vec::new(),
            full_export,
            drains: Vec::new(),
        }
    }

    /// Returns the number of records across all entries.
    pub fn record_count(&self) -> usize {
        self.entries.iter().map(|e| e.records.len()).sum()
    }

    /// Returns the types present in this batch.
    pub fn type_ids(&self) -> impl Iterator<Item = &DataTypeId> {
        self.entries.iter().map(|e| &e.type_id)
    }

    /// Encodes the batch as an upload body.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(encode_batch(
            self.entries
                .iter()
                .map(|e| (&e.type_id, e.records.as_slice())),
            self.full_export,
        )?)
    }

    fn push(&mut self, type_id: &DataTypeId, records: Vec<Record>) {
        match self.entries.last_mut() {
            Some(last) if &last.type_id == type_id => last.records.extend(records),
            _ => self.entries.push(BatchEntry {
                type_id: type_id.clone(),
                records,
            }),
        }
    }
}

/// Packs record sets into batches of at most `capacity` records.
///
/// Packing is greedy and order-preserving:
/// - a type that fits in the room left in the open batch joins it
/// - a type that fits in an empty batch but not in the room left starts a
///   new batch rather than being split
/// - a type larger than a whole batch fills the room left and continues in
///   full batches
///
/// Full-export and incremental records never share a batch, so the batch
/// level `full_export` flag is exact. Empty record sets produce no batch.
#[derive(Debug, Clone, Copy)]
pub struct Batcher {
    capacity: usize,
}

impl Batcher {
    /// Creates a batcher. A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Returns the maximum number of records per batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Splits `sets` into batches, consuming their records.
    pub fn split(&self, sets: Vec<RecordSet>) -> Vec<UploadBatch> {
        let mut batches: Vec<UploadBatch> = Vec::new();
        let mut open: Option<UploadBatch> = None;

        for set in sets {
            if set.records.is_empty() {
                continue;
            }
            let type_id = set.type_id;
            let mut records = set.records;

            if let Some(batch) = open.take() {
                let room = self.capacity - batch.record_count();
                let fits = records.len() <= room;
                let oversized = records.len() > self.capacity;
                if batch.full_export == set.full_export && (fits || oversized) {
                    open = Some(batch);
                } else {
                    batches.push(batch);
                }
            }

            while !records.is_empty() {
                let mut batch = match open.take() {
                    Some(batch) => batch,
                    None => UploadBatch::new(batches.len(), set.full_export),
                };

                let room = self.capacity - batch.record_count();
                let take = room.min(records.len());
                let rest = records.split_off(take);
                batch.push(&type_id, records);
                records = rest;

                if records.is_empty() {
                    batch.drains.push(type_id.clone());
                }
                if batch.record_count() == self.capacity {
                    batches.push(batch);
                } else {
                    open = Some(batch);
                }
            }
        }

        batches.extend(open);
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorToken;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn record(value: f64) -> Record {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Record::new(value, "count", t, t)
    }

    fn set(type_id: &str, count: usize, full_export: bool) -> RecordSet {
        RecordSet {
            type_id: type_id.into(),
            records: (0..count).map(|i| record(i as f64)).collect(),
            anchor: AnchorToken::new(count.to_string()),
            full_export,
            skipped_deletions: 0,
        }
    }

    fn shape(batches: &[UploadBatch]) -> Vec<Vec<(String, usize)>> {
        batches
            .iter()
            .map(|b| {
                b.entries
                    .iter()
                    .map(|e| (e.type_id.to_string(), e.records.len()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn steps_and_heart_rate_share_the_last_batch() {
        let batches = Batcher::new(2).split(vec![
            set("steps", 5, true),
            set("heart_rate", 1, true),
        ]);

        assert_eq!(batches.len(), 3);
        assert_eq!(
            shape(&batches),
            vec![
                vec![("steps".into(), 2)],
                vec![("steps".into(), 2)],
                vec![("steps".into(), 1), ("heart_rate".into(), 1)],
            ]
        );
        assert_eq!(
            batches[2].drains,
            vec![DataTypeId::from("steps"), DataTypeId::from("heart_rate")]
        );
        assert!(batches[0].drains.is_empty());
        assert_eq!(batches.iter().map(|b| b.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn type_that_fits_a_fresh_batch_is_not_split() {
        let batches = Batcher::new(4).split(vec![set("a", 3, false), set("b", 3, false)]);
        assert_eq!(
            shape(&batches),
            vec![vec![("a".into(), 3)], vec![("b".into(), 3)]]
        );
    }

    #[test]
    fn oversized_type_fills_remaining_room() {
        let batches = Batcher::new(4).split(vec![set("a", 3, false), set("b", 6, false)]);
        assert_eq!(
            shape(&batches),
            vec![
                vec![("a".into(), 3), ("b".into(), 1)],
                vec![("b".into(), 4)],
                vec![("b".into(), 1)],
            ]
        );
    }

    #[test]
    fn full_and_incremental_sets_do_not_mix() {
        let batches = Batcher::new(10).split(vec![set("a", 2, true), set("b", 2, false)]);
        assert_eq!(batches.len(), 2);
        assert!(batches[0].full_export);
        assert!(!batches[1].full_export);
    }

    #[test]
    fn empty_sets_produce_no_batches() {
        let batches = Batcher::new(10).split(vec![set("a", 0, false), set("b", 0, true)]);
        assert!(batches.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(Batcher::new(0).capacity(), 1);
    }

    #[test]
    fn batch_encodes_all_entries() {
        let batches = Batcher::new(10).split(vec![set("a", 2, false), set("b", 1, false)]);
        let body = batches[0].encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["a"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"]["b"].as_array().unwrap().len(), 1);
        assert_eq!(json["fullExport"], false);
    }

    proptest! {
        #[test]
        fn split_preserves_records_and_bounds(
            sizes in proptest::collection::vec((0usize..12, any::<bool>()), 0..6),
            capacity in 1usize..7,
        ) {
            let sets: Vec<RecordSet> = sizes
                .iter()
                .enumerate()
                .map(|(i, (n, full))| set(&format!("type{i}"), *n, *full))
                .collect();
            let expected: Vec<(DataTypeId, uuid::Uuid)> = sets
                .iter()
                .flat_map(|s| s.records.iter().map(move |r| (s.type_id.clone(), r.id)))
                .collect();

            let batches = Batcher::new(capacity).split(sets.clone());

            let delivered: Vec<(DataTypeId, uuid::Uuid)> = batches
                .iter()
                .flat_map(|b| b.entries.iter())
                .flat_map(|e| e.records.iter().map(move |r| (e.type_id.clone(), r.id)))
                .collect();
            prop_assert_eq!(delivered, expected);

            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.index, i);
                prop_assert!(batch.record_count() >= 1);
                prop_assert!(batch.record_count() <= capacity);
            }

            // Every non-empty type is drained exactly once, in its last batch.
            for s in sets.iter().filter(|s| !s.records.is_empty()) {
                let last = batches
                    .iter()
                    .rposition(|b| b.type_ids().any(|t| t == &s.type_id))
                    .unwrap();
                let drained: Vec<usize> = batches
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.drains.contains(&s.type_id))
                    .map(|(i, _)| i)
                    .collect();
                prop_assert_eq!(drained, vec![last]);
            }
        }
    }
}
