//! Anchor list and reset commands.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use vitalsync_engine::{AnchorStore, EndpointKey};
use vitalsync_storage::FileStore;

/// One stored anchor as printed by `anchors list`.
#[derive(Debug, Serialize)]
pub struct AnchorRow {
    /// Data type id.
    pub type_id: String,
    /// Opaque data source cursor.
    pub token: String,
    /// Commit time, RFC 3339.
    pub updated_at: String,
}

fn open(store: &Path) -> Result<AnchorStore, Box<dyn std::error::Error>> {
    if !store.exists() {
        return Err(format!("No anchor store found at {:?}", store).into());
    }
    Ok(AnchorStore::new(Arc::new(FileStore::open(store)?)))
}

/// Lists the anchors stored for `endpoint`.
pub fn list(store: &Path, endpoint: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let anchors = open(store)?;
    let key = EndpointKey::from_url(endpoint);
    let rows: Vec<AnchorRow> = anchors
        .list(&key)?
        .into_iter()
        .map(|(type_id, anchor)| AnchorRow {
            type_id: type_id.to_string(),
            token: anchor.token.to_string(),
            updated_at: anchor.updated_at.to_rfc3339(),
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        "text" => {
            println!("Endpoint: {endpoint} ({key})");
            if rows.is_empty() {
                println!("  no anchors; the next push is a full export");
            }
            for row in &rows {
                println!("  {:<24} {:<16} {}", row.type_id, row.token, row.updated_at);
            }
        }
        other => return Err(format!("Unknown format: {other}").into()),
    }
    Ok(())
}

/// Deletes every anchor stored for `endpoint`.
pub fn reset(store: &Path, endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let anchors = open(store)?;
    let key = EndpointKey::from_url(endpoint);
    let removed = anchors.reset_all(&key)?;
    info!(endpoint = %key, removed, "anchors reset");
    println!("✓ Removed {removed} anchors for {endpoint}");
    Ok(())
}
