//! End-to-end tests of the sync engine with in-memory collaborators.

use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vitalsync_engine::{
    AnchorStore, ManualScheduler, MemoryDataSource, MockReply, MockUploader, RecordingEventSink,
    RequestOutcome, RetryConfig, SessionOutcome, SessionRegistry, SyncConfig, SyncEvent,
    SyncResult, SyncService, ThreadScheduler, TypeOutcome, UploadRequest, UploadResponse,
    Uploader,
};
use vitalsync_protocol::{DataTypeId, Record, UploadPayload};
use vitalsync_storage::{FileStore, InMemoryStore, KeyValueStore};

const ENDPOINT_A: &str = "https://a.example.com/v1/samples";
const ENDPOINT_B: &str = "https://b.example.com/v1/samples";

type Service<U> = SyncService<MemoryDataSource, U, ManualScheduler>;

fn record(minute: u32) -> Record {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap();
    Record::new(f64::from(minute), "count", start, start)
}

fn config(endpoint: &str) -> SyncConfig {
    SyncConfig::new(endpoint, "secret")
        .with_types(["steps", "heart_rate"])
        .with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
}

fn service_with<U: Uploader + 'static>(
    source: &Arc<MemoryDataSource>,
    uploader: &Arc<U>,
    store: Arc<dyn KeyValueStore>,
) -> Service<U> {
    SyncService::new(
        source.clone(),
        uploader.clone(),
        Arc::new(ManualScheduler::new()),
        store,
    )
}

fn only_report(outcome: RequestOutcome) -> vitalsync_engine::SessionReport {
    match outcome {
        RequestOutcome::Ran(mut reports) => {
            assert_eq!(reports.len(), 1);
            reports.remove(0)
        }
        other => panic!("expected one session, got {other:?}"),
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Start dates of the records in every request, in order.
fn uploaded_starts(uploader: &MockUploader) -> Vec<Vec<i64>> {
    uploader
        .payloads()
        .iter()
        .map(|p| p.data.values().flatten().map(|r| r.start.timestamp()).collect())
        .collect()
}

#[test]
fn anchor_does_not_advance_when_a_later_batch_fails() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv = Arc::new(InMemoryStore::new());
    let service = service_with(&source, &uploader, kv.clone());
    service.initialize(config(ENDPOINT_A).with_records_per_chunk(2));

    source.add("steps", record(0));
    assert!(only_report(service.sync_now()).is_success());
    let anchors = AnchorStore::new(kv);
    let endpoint = config(ENDPOINT_A).endpoint_key();
    let before = anchors.get(&endpoint, &"steps".into()).unwrap();

    source.add_all("steps", (1..6).map(record));
    uploader.push_replies([MockReply::Status(200), MockReply::Status(422)]);
    let report = only_report(service.sync_now());

    assert!(!report.is_success());
    assert!(matches!(
        report.type_outcome(&"steps".into()),
        Some(TypeOutcome::Failed { .. })
    ));
    let after = anchors.get(&endpoint, &"steps".into()).unwrap();
    assert_eq!(after.token, before.token);
}

#[test]
fn commit_failure_means_records_are_sent_again() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv = Arc::new(InMemoryStore::new());
    let service = service_with(&source, &uploader, kv.clone());
    service.initialize(config(ENDPOINT_A));

    source.add_all("steps", [record(1), record(2)]);
    kv.set_fail_writes(true);
    let first = only_report(service.sync_now());
    assert!(matches!(
        first.outcome,
        SessionOutcome::Failed {
            kind: vitalsync_engine::SyncErrorKind::Persistence,
            ..
        }
    ));

    kv.set_fail_writes(false);
    source.add("steps", record(3));
    let second = only_report(service.sync_now());
    assert!(second.is_success());

    let sent = uploaded_starts(&uploader);
    assert_eq!(sent.len(), 2);
    let first_batch: HashSet<_> = sent[0].iter().collect();
    let second_batch: HashSet<_> = sent[1].iter().collect();
    assert!(first_batch.is_subset(&second_batch));
    assert_eq!(second_batch.len(), 3);
}

/// Measures how many posts overlap.
#[derive(Default)]
struct ConcurrencyProbe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Uploader for ConcurrencyProbe {
    fn post(&self, _request: &UploadRequest) -> SyncResult<UploadResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(UploadResponse { status: 200 })
    }
}

#[test]
fn concurrent_requests_never_overlap() {
    let source = Arc::new(MemoryDataSource::new());
    let probe = Arc::new(ConcurrencyProbe::default());
    let service = Arc::new(service_with(
        &source,
        &probe,
        Arc::new(InMemoryStore::new()),
    ));
    service.initialize(config(ENDPOINT_A).with_records_per_chunk(1));
    source.add_all("steps", (0..3).map(record));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            std::thread::spawn(move || service.sync_now())
        })
        .collect();
    let outcomes: Vec<RequestOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);

    let ran: usize = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::Ran(_)))
        .count();
    let queued = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::Queued))
        .count();
    let reports: usize = outcomes.iter().map(|o| o.reports().len()).sum();
    assert!(ran >= 1);
    // Every queued request ran exactly once, on the thread that owned the
    // endpoint at the time.
    assert_eq!(reports, ran + queued);
    for outcome in &outcomes {
        assert!(outcome.reports().len() <= 2);
    }
}

#[test]
fn endpoints_never_share_anchors() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
    let registry = SessionRegistry::new();

    let a = service_with(&source, &uploader, kv.clone()).with_registry(registry.clone());
    let b = service_with(&source, &uploader, kv.clone()).with_registry(registry);
    a.initialize(config(ENDPOINT_A));
    b.initialize(config(ENDPOINT_B));

    source.add_all("steps", [record(1), record(2)]);
    assert!(only_report(a.sync_now()).is_success());
    assert_eq!(a.anchors().unwrap().len(), 2);
    assert!(b.anchors().unwrap().is_empty());

    source.add("steps", record(3));
    let report_b = only_report(b.sync_now());
    assert_eq!(
        report_b.type_outcome(&"steps".into()),
        Some(&TypeOutcome::Committed {
            records: 3,
            full_export: true
        })
    );
    let report_a = only_report(a.sync_now());
    assert_eq!(
        report_a.type_outcome(&"steps".into()),
        Some(&TypeOutcome::Committed {
            records: 1,
            full_export: false
        })
    );

    assert!(a.reset_anchors());
    assert!(a.anchors().unwrap().is_empty());
    assert_eq!(b.anchors().unwrap().len(), 2);
}

#[test]
fn full_export_happens_once_per_reset() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let service = service_with(&source, &uploader, Arc::new(InMemoryStore::new()));
    service.initialize(config(ENDPOINT_A));

    let full_export_flags = |report: &vitalsync_engine::SessionReport| -> Vec<bool> {
        report
            .types
            .values()
            .map(|t| match t {
                TypeOutcome::Committed { full_export, .. } => *full_export,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect()
    };

    source.add("steps", record(1));
    let first = only_report(service.sync_now());
    assert_eq!(full_export_flags(&first), vec![true, true]);

    for minute in 2..4 {
        source.add("heart_rate", record(minute));
        let next = only_report(service.sync_now());
        assert_eq!(full_export_flags(&next), vec![false, false]);
    }

    assert!(service.reset_anchors());
    source.clear_queries();
    let after_reset = only_report(service.sync_now());
    assert_eq!(full_export_flags(&after_reset), vec![true, true]);

    let queried: Vec<(DataTypeId, bool)> = source
        .queries()
        .into_iter()
        .map(|(t, anchor)| (t, anchor.is_none()))
        .collect();
    assert_eq!(
        queried,
        vec![("steps".into(), true), ("heart_rate".into(), true)]
    );
}

#[test]
fn two_records_per_chunk_scenario() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv = Arc::new(InMemoryStore::new());
    let service = service_with(&source, &uploader, kv.clone());
    service.initialize(config(ENDPOINT_A).with_records_per_chunk(2));

    source.add_all("steps", (0..5).map(record));
    source.add("heart_rate", record(30));

    // Count stored anchors at the moment each batch is posted.
    let anchors_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let anchors_seen = anchors_seen.clone();
        let kv = kv.clone();
        uploader.on_post(move |_| anchors_seen.lock().push(kv.len()));
    }

    let report = only_report(service.sync_now());

    assert!(report.is_success());
    assert_eq!(report.batches_sent, 3);
    assert_eq!(report.records_uploaded, 6);

    let payloads: Vec<UploadPayload> = uploader.payloads();
    assert_eq!(payloads.len(), 3);
    assert!(payloads.iter().all(|p| p.record_count() <= 2));
    assert!(payloads.iter().all(|p| p.full_export));
    assert_eq!(payloads[2].data.len(), 2);
    assert_eq!(payloads[2].data[&DataTypeId::from("heart_rate")].len(), 1);

    assert_eq!(*anchors_seen.lock(), vec![0, 0, 0]);
    assert_eq!(kv.len(), 2);
}

#[test]
fn stop_cancels_session_before_commit() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv = Arc::new(InMemoryStore::new());
    let service = Arc::new(service_with(&source, &uploader, kv.clone()));
    service.initialize(config(ENDPOINT_A));
    source.add("steps", record(1));
    assert!(service.start_background_sync());

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    {
        let entered = entered.clone();
        let release = release.clone();
        uploader.on_post(move |_| {
            entered.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    }

    let runner = Arc::clone(&service);
    let session = std::thread::spawn(move || runner.sync_now());
    wait_until("upload to start", || entered.load(Ordering::SeqCst));

    service.stop_background_sync();
    assert!(!service.is_background_running());
    release.store(true, Ordering::SeqCst);

    let report = only_report(session.join().unwrap());
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert!(kv.is_empty());
    assert_eq!(uploader.cancel_count(), 1);
}

#[test]
fn reconfiguring_cancels_the_running_session_and_runs_the_next_request() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let kv = Arc::new(InMemoryStore::new());
    let service = Arc::new(service_with(&source, &uploader, kv.clone()));
    service.initialize(config(ENDPOINT_A));
    source.add("steps", record(1));

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    {
        let entered = entered.clone();
        let release = release.clone();
        uploader.on_post(move |_| {
            entered.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    }

    let runner = Arc::clone(&service);
    let session = std::thread::spawn(move || runner.sync_now());
    wait_until("upload to start", || entered.load(Ordering::SeqCst));

    service.initialize(
        SyncConfig::new(ENDPOINT_A, "rotated").with_types(["steps", "heart_rate"]),
    );
    assert!(matches!(service.sync_now(), RequestOutcome::Queued));
    assert!(kv.is_empty());
    release.store(true, Ordering::SeqCst);

    let reports = match session.join().unwrap() {
        RequestOutcome::Ran(reports) => reports,
        other => panic!("expected sessions, got {other:?}"),
    };
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].outcome, SessionOutcome::Cancelled);
    assert!(reports[0]
        .types
        .values()
        .all(|t| !matches!(t, TypeOutcome::Committed { .. })));
    assert!(reports[1].is_success());

    let tokens: Vec<String> = uploader
        .requests()
        .iter()
        .filter_map(|r| r.header("Authorization").map(str::to_string))
        .collect();
    assert_eq!(tokens, vec!["Bearer secret", "Bearer rotated"]);

    let anchors = AnchorStore::new(kv);
    let endpoint = config(ENDPOINT_A).endpoint_key();
    assert!(anchors.get(&endpoint, &"steps".into()).is_some());
    assert_eq!(service.stats().sessions_succeeded, 1);
}

#[test]
fn rejected_token_silences_automatic_triggers() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let events = Arc::new(RecordingEventSink::new());
    let service = SyncService::new(
        source.clone(),
        uploader.clone(),
        scheduler.clone(),
        Arc::new(InMemoryStore::new()),
    )
    .with_events(events.clone());
    let config = config(ENDPOINT_A);
    let task_id = format!("vitalsync-catch-up-{}", config.endpoint_key());
    service.initialize(config);
    assert!(service.start_background_sync());

    source.add("steps", record(1));
    uploader.set_default_reply(MockReply::Status(403));
    service.sync_now();
    assert_eq!(uploader.request_count(), 1);

    assert!(scheduler.fire(&task_id));
    source.add("steps", record(2));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(uploader.request_count(), 1);

    // Manual syncs still run and report the rejection again.
    let report = only_report(service.sync_now());
    assert!(matches!(
        report.outcome,
        SessionOutcome::Failed {
            kind: vitalsync_engine::SyncErrorKind::TokenRejected,
            ..
        }
    ));
    assert_eq!(uploader.request_count(), 2);
    assert_eq!(
        events
            .matching(|e| matches!(e, SyncEvent::SessionStarted { .. }))
            .len(),
        2
    );
    service.stop_background_sync();
}

#[test]
fn observer_bursts_produce_one_upload() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let service = service_with(&source, &uploader, Arc::new(InMemoryStore::new()));
    service.initialize(config(ENDPOINT_A).with_debounce(Duration::from_millis(100)));
    assert!(service.start_background_sync());

    for minute in 0..10 {
        source.add("steps", record(minute));
    }

    wait_until("observer upload", || uploader.request_count() == 1);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(uploader.request_count(), 1);
    assert_eq!(uploader.payloads()[0].record_count(), 10);
    service.stop_background_sync();
}

#[test]
fn thread_scheduler_drives_catch_up() {
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    let service = SyncService::new(
        source.clone(),
        uploader.clone(),
        Arc::new(ThreadScheduler::new()),
        Arc::new(InMemoryStore::new()),
    );
    service.initialize(
        config(ENDPOINT_A)
            .with_periodic_interval(Duration::from_millis(20))
            .with_debounce(Duration::from_secs(60)),
    );
    assert!(service.start_background_sync());

    source.add("steps", record(1));
    wait_until("periodic upload", || uploader.request_count() >= 1);
    wait_until("anchors", || service.anchors().map(|a| a.len() == 2).unwrap_or(false));
    service.stop_background_sync();
    assert_eq!(uploader.payloads()[0].record_count(), 1);
}

#[test]
fn anchors_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryDataSource::new());
    let uploader = Arc::new(MockUploader::new());
    source.add_all("steps", [record(1), record(2)]);

    {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let service = service_with(&source, &uploader, store);
        service.initialize(config(ENDPOINT_A));
        assert!(only_report(service.sync_now()).is_success());
    }

    source.add("steps", record(3));
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let service = service_with(&source, &uploader, store);
    service.initialize(config(ENDPOINT_A));
    let report = only_report(service.sync_now());

    assert_eq!(
        report.type_outcome(&"steps".into()),
        Some(&TypeOutcome::Committed {
            records: 1,
            full_export: false
        })
    );
}
