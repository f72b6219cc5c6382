//! Upload request body and headers.

use crate::error::ProtocolResult;
use crate::record::{DataTypeId, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `Content-Type` header name.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// `Authorization` header name.
pub const AUTHORIZATION_HEADER: &str = "Authorization";
/// `Content-Length` header name.
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";
/// Media type of every upload body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An upload request body.
///
/// This is the owned form, used by receivers and tests. Senders that already
/// hold records in a batch use [`encode_batch`] to avoid copying them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    /// Records grouped by data type.
    pub data: BTreeMap<DataTypeId, Vec<Record>>,
    /// True when the records come from a full export.
    #[serde(rename = "fullExport")]
    pub full_export: bool,
}

impl UploadPayload {
    /// Encodes the payload as JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_batch(
            self.data.iter().map(|(id, records)| (id, records.as_slice())),
            self.full_export,
        )
    }

    /// Decodes a payload from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns the total number of records across all types.
    pub fn record_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    data: BTreeMap<&'a str, &'a [Record]>,
    #[serde(rename = "fullExport")]
    full_export: bool,
}

/// Encodes borrowed per-type record slices as an upload body.
///
/// Every record is validated first; a record that cannot be represented in
/// JSON fails the whole body rather than being silently altered.
pub fn encode_batch<'a, I>(entries: I, full_export: bool) -> ProtocolResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a DataTypeId, &'a [Record])>,
{
    let mut data = BTreeMap::new();
    for (type_id, records) in entries {
        for record in records {
            record.validate()?;
        }
        data.insert(type_id.as_str(), records);
    }

    Ok(serde_json::to_vec(&PayloadRef { data, full_export })?)
}
