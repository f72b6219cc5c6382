//! Push command implementation.

use crate::http::{DryRunUploader, ReqwestUploader};
use crate::source::FileDataSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vitalsync_engine::{
    ManualScheduler, RequestOutcome, SessionOutcome, SessionReport, SyncConfig, SyncService,
    TypeOutcome, Uploader,
};
use vitalsync_storage::{FileStore, InMemoryStore, KeyValueStore};

/// Options of the push command.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Ingestion endpoint URL.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// Record file to upload.
    pub records: PathBuf,
    /// Maximum records per request.
    pub records_per_chunk: usize,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Print requests instead of sending them.
    pub dry_run: bool,
}

/// Runs the push command.
pub fn run(store: &Path, options: PushOptions) -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(FileDataSource::load(&options.records)?);
    info!(
        path = %options.records.display(),
        types = source.type_ids().len(),
        records = source.record_count(),
        "loaded record file"
    );

    let config = SyncConfig::new(&options.endpoint, &options.token)
        .with_types(source.type_ids())
        .with_records_per_chunk(options.records_per_chunk)
        .with_timeout(Duration::from_secs(options.timeout_secs));
    config.validate()?;

    let anchors = Arc::new(FileStore::open(store)?);
    let reports = if options.dry_run {
        // The preview runs against a copy so stored anchors stay put.
        let scratch = Arc::new(InMemoryStore::new());
        copy_entries(&*anchors, &*scratch)?;
        push(source, Arc::new(DryRunUploader), scratch, config)?
    } else {
        push(source, Arc::new(ReqwestUploader::new()?), anchors, config)?
    };

    let mut failed = false;
    for report in &reports {
        print_report(report, &options.endpoint, options.dry_run);
        failed |= !report.is_success();
    }
    if failed {
        return Err("push did not complete; failed types are sent again next time".into());
    }
    Ok(())
}

fn push<U: Uploader + 'static>(
    source: Arc<FileDataSource>,
    uploader: Arc<U>,
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
) -> Result<Vec<SessionReport>, Box<dyn std::error::Error>> {
    let service = SyncService::new(source, uploader, Arc::new(ManualScheduler::new()), store);
    service.initialize(config);
    if !service.request_authorization() {
        return Err("read access was denied".into());
    }

    match service.sync_now() {
        RequestOutcome::Ran(reports) => Ok(reports),
        RequestOutcome::Refused(reason) => Err(reason.into()),
        other => Err(format!("push did not run: {other:?}").into()),
    }
}

fn copy_entries(
    from: &dyn KeyValueStore,
    to: &dyn KeyValueStore,
) -> Result<(), Box<dyn std::error::Error>> {
    for key in from.keys_with_prefix("")? {
        if let Some(value) = from.get(&key)? {
            to.set(&key, &value)?;
        }
    }
    Ok(())
}

fn print_report(report: &SessionReport, endpoint: &str, dry_run: bool) {
    let verb = if dry_run { "Would push" } else { "Pushed" };
    match &report.outcome {
        SessionOutcome::Succeeded => println!(
            "✓ {} {} records in {} batches to {}",
            verb, report.records_uploaded, report.batches_sent, endpoint
        ),
        SessionOutcome::Failed { kind, message } => {
            println!("✗ Push failed ({kind:?}): {message}")
        }
        SessionOutcome::Cancelled => println!("✗ Push cancelled"),
    }
    if report.retries > 0 {
        println!("  {} retries", report.retries);
    }

    for (type_id, outcome) in &report.types {
        match outcome {
            TypeOutcome::Committed {
                records,
                full_export,
            } => println!(
                "  {}: {} records{}",
                type_id,
                records,
                if *full_export { " (full export)" } else { "" }
            ),
            TypeOutcome::Failed { kind, message } => {
                println!("  {type_id}: failed ({kind:?}): {message}")
            }
            TypeOutcome::Skipped => println!("  {type_id}: skipped"),
        }
    }
}
