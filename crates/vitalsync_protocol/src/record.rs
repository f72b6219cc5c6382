//! Sample records and data-type identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a tracked sample type (e.g. `HKQuantityTypeIdentifierStepCount`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTypeId(String);

impl DataTypeId {
    /// Creates a data-type id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataTypeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DataTypeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One sample of a tracked data type.
///
/// Records are immutable once produced by the collector. The `id` is the
/// data source's identifier for the sample; it is used to match deletions
/// and is not part of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Source identifier of the sample.
    #[serde(skip_serializing, default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Numeric value.
    pub value: f64,
    /// Unit string, e.g. `count` or `count/min`.
    pub unit: String,
    /// Start of the sampled interval.
    #[serde(rename = "startDate", serialize_with = "serialize_iso8601")]
    pub start: DateTime<Utc>,
    /// End of the sampled interval.
    #[serde(rename = "endDate", serialize_with = "serialize_iso8601")]
    pub end: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    /// Creates a record with a fresh id and no metadata.
    pub fn new(
        value: f64,
        unit: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            value,
            unit: unit.into(),
            start,
            end,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the source identifier.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Checks that the record can be represented on the wire.
    ///
    /// JSON has no encoding for NaN or infinities, and an interval must not
    /// end before it starts.
    pub fn validate(&self) -> ProtocolResult<()> {
        if !self.value.is_finite() {
            return Err(ProtocolError::InvalidRecord(format!(
                "record {} has non-finite value {}",
                self.id, self.value
            )));
        }
        if self.end < self.start {
            return Err(ProtocolError::InvalidRecord(format!(
                "record {} ends before it starts",
                self.id
            )));
        }
        Ok(())
    }
}

fn serialize_iso8601<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}
