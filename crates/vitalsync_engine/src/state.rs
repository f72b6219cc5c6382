//! Sync orchestrator state machine.

use crate::anchor::{AnchorStore, AnchorToken};
use crate::batcher::Batcher;
use crate::collector::ChangeCollector;
use crate::config::SyncConfig;
use crate::endpoint::EndpointKey;
use crate::error::{SyncError, SyncErrorKind};
use crate::events::{EventSink, SyncEvent};
use crate::session::{
    Admission, CancelFlag, Enqueue, RequestOutcome, SessionOutcome, SessionRegistry,
    SessionReport, SessionRunner, SyncTrigger, TypeOutcome,
};
use crate::source::DataSource;
use crate::transport::Uploader;
use crate::upload::UploadPipeline;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use vitalsync_protocol::DataTypeId;

/// The current state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No session is running.
    Idle,
    /// A session was admitted.
    Starting,
    /// Querying the data source.
    Collecting,
    /// Sending batches.
    Uploading,
    /// Advancing anchors.
    Committing,
    /// The last session failed.
    Failed,
    /// The last session was cancelled.
    Cancelled,
}

impl SyncState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Starting
                | SyncState::Collecting
                | SyncState::Uploading
                | SyncState::Committing
        )
    }
}

/// Statistics about sync sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that ran.
    pub sessions_started: u64,
    /// Sessions that committed every tracked type.
    pub sessions_succeeded: u64,
    /// Sessions that ended in `Failed`.
    pub sessions_failed: u64,
    /// Sessions that observed a cancellation.
    pub sessions_cancelled: u64,
    /// Records accepted by the server.
    pub records_uploaded: u64,
    /// Batches accepted by the server.
    pub batches_uploaded: u64,
    /// Retries spent on transient failures.
    pub retries: u64,
    /// End of the last successful session.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Drives sessions for one configuration.
///
/// The orchestrator is a cheap handle; clones share state. Sessions run on
/// the thread that calls [`request_sync`](Self::request_sync), and are
/// serialized per endpoint through a [`SessionRegistry`] that may be shared
/// with other orchestrators.
pub struct SyncOrchestrator<D: DataSource, U: Uploader> {
    inner: Arc<Inner<D, U>>,
}

impl<D: DataSource, U: Uploader> Clone for SyncOrchestrator<D, U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<D: DataSource, U: Uploader> {
    config: SyncConfig,
    endpoint: EndpointKey,
    collector: ChangeCollector<D>,
    batcher: Batcher,
    pipeline: UploadPipeline<U>,
    uploader: Arc<U>,
    anchors: Arc<AnchorStore>,
    registry: SessionRegistry,
    events: Arc<dyn EventSink>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    token_rejected: AtomicBool,
}

impl<D: DataSource + 'static, U: Uploader + 'static> SyncOrchestrator<D, U> {
    /// Creates an orchestrator for `config`.
    ///
    /// The configuration is not validated here; see [`SyncConfig::validate`].
    pub fn new(
        config: SyncConfig,
        source: Arc<D>,
        uploader: Arc<U>,
        anchors: Arc<AnchorStore>,
        registry: SessionRegistry,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let endpoint = config.endpoint_key();
        let batcher = Batcher::new(config.batch_capacity());
        let pipeline = UploadPipeline::new(Arc::clone(&uploader), &config);

        Self {
            inner: Arc::new(Inner {
                endpoint,
                collector: ChangeCollector::new(source),
                batcher,
                pipeline,
                uploader,
                anchors,
                registry,
                events,
                config,
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
                token_rejected: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the configuration this orchestrator runs with.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns the endpoint key.
    pub fn endpoint(&self) -> &EndpointKey {
        &self.inner.endpoint
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.inner.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns true once the server rejected the token.
    ///
    /// Automatic triggers are refused from then on; only a new configuration
    /// clears the condition.
    pub fn is_locked_out(&self) -> bool {
        self.inner.token_rejected.load(Ordering::SeqCst)
    }

    /// Returns true while a session runs for this endpoint.
    pub fn is_busy(&self) -> bool {
        self.inner.registry.is_busy(&self.inner.endpoint)
    }

    /// Requests a session.
    ///
    /// If the endpoint is idle the session runs on the calling thread,
    /// followed by a manual request queued meanwhile. If it is busy, manual
    /// requests are queued (at most one) and automatic ones are coalesced.
    pub fn request_sync(&self, trigger: SyncTrigger) -> RequestOutcome {
        let inner = &self.inner;
        if trigger != SyncTrigger::Manual && self.is_locked_out() {
            debug!(endpoint = %inner.endpoint, %trigger, "token rejected earlier; trigger refused");
            return RequestOutcome::Refused("bearer token was rejected".into());
        }

        loop {
            match inner.registry.try_begin(&inner.endpoint) {
                Admission::Granted(mut guard) => {
                    let mut reports = vec![inner.run_session(trigger, guard.cancel_flag())];
                    while let Some(runner) = guard.take_queued() {
                        let cancel = guard.cancel_flag().clone();
                        reports.push(runner.run(SyncTrigger::Manual, &cancel));
                    }
                    return RequestOutcome::Ran(reports);
                }
                Admission::Busy if trigger != SyncTrigger::Manual => {
                    debug!(endpoint = %inner.endpoint, %trigger, "session in flight; trigger coalesced");
                    return RequestOutcome::Coalesced;
                }
                Admission::Busy => {
                    let runner: Arc<dyn SessionRunner> = Arc::clone(inner) as Arc<dyn SessionRunner>;
                    match inner.registry.enqueue(&inner.endpoint, runner) {
                        Enqueue::Queued => {
                            debug!(endpoint = %inner.endpoint, "session in flight; manual sync queued");
                            return RequestOutcome::Queued;
                        }
                        Enqueue::Full => {
                            debug!(endpoint = %inner.endpoint, "manual sync already queued; request dropped");
                            return RequestOutcome::Dropped;
                        }
                        // The running session ended between the two checks.
                        Enqueue::Idle => continue,
                    }
                }
            }
        }
    }

    /// Cancels the running session, if any, and discards a queued manual
    /// request.
    ///
    /// The session stops at its next check: before a collection, between
    /// batches, during backoff or before a commit. Anchors committed before
    /// that stay committed.
    pub fn cancel(&self) {
        if self.inner.registry.cancel(&self.inner.endpoint) {
            info!(endpoint = %self.inner.endpoint, "cancelling sync session");
            self.inner.uploader.cancel();
        }
    }
}

/// Mutable bookkeeping of one running session.
struct SessionRun {
    id: Uuid,
    types: BTreeMap<DataTypeId, TypeOutcome>,
    first_error: Option<(SyncErrorKind, String)>,
    batches_sent: usize,
    records_uploaded: usize,
    retries: u32,
}

impl SessionRun {
    fn is_failed(&self, type_id: &DataTypeId) -> bool {
        matches!(self.types.get(type_id), Some(TypeOutcome::Failed { .. }))
    }
}

/// What the collection phase produced for one type.
struct Pending {
    type_id: DataTypeId,
    anchor: AnchorToken,
    records: usize,
    full_export: bool,
}

impl<D: DataSource, U: Uploader> Inner<D, U> {
    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn run_session(&self, trigger: SyncTrigger, cancel: &CancelFlag) -> SessionReport {
        let started = Instant::now();
        let mut run = SessionRun {
            id: Uuid::new_v4(),
            types: self
                .config
                .tracked_types
                .iter()
                .map(|t| (t.clone(), TypeOutcome::Skipped))
                .collect(),
            first_error: None,
            batches_sent: 0,
            records_uploaded: 0,
            retries: 0,
        };

        let span = info_span!("sync_session", session_id = %run.id, endpoint = %self.endpoint, %trigger);
        let _enter = span.enter();

        self.set_state(SyncState::Starting);
        self.stats.write().sessions_started += 1;
        info!(types = self.config.tracked_types.len(), "sync session started");
        self.events.emit(SyncEvent::SessionStarted {
            session_id: run.id,
            endpoint: self.endpoint.clone(),
            trigger,
        });

        let outcome = match self.drive(&mut run, cancel) {
            Ok(()) => match &run.first_error {
                None => SessionOutcome::Succeeded,
                Some((kind, message)) => SessionOutcome::Failed {
                    kind: *kind,
                    message: message.clone(),
                },
            },
            Err(SyncError::Cancelled) => SessionOutcome::Cancelled,
            Err(e) => {
                if matches!(e, SyncError::TokenRejected { .. }) {
                    self.token_rejected.store(true, Ordering::SeqCst);
                }
                let message = e.to_string();
                for outcome in run.types.values_mut() {
                    if *outcome == TypeOutcome::Skipped {
                        *outcome = TypeOutcome::Failed {
                            kind: e.kind(),
                            message: message.clone(),
                        };
                    }
                }
                SessionOutcome::Failed {
                    kind: e.kind(),
                    message,
                }
            }
        };

        self.finish(&run, &outcome);

        let report = SessionReport {
            session_id: run.id,
            endpoint: self.endpoint.clone(),
            trigger,
            outcome: outcome.clone(),
            types: run.types,
            batches_sent: run.batches_sent,
            records_uploaded: run.records_uploaded,
            retries: run.retries,
            duration: started.elapsed(),
        };
        self.events.emit(SyncEvent::SessionFinished {
            session_id: report.session_id,
            outcome,
        });
        report
    }

    fn finish(&self, run: &SessionRun, outcome: &SessionOutcome) {
        let mut stats = self.stats.write();
        stats.records_uploaded += run.records_uploaded as u64;
        stats.batches_uploaded += run.batches_sent as u64;
        stats.retries += u64::from(run.retries);

        let terminal = match outcome {
            SessionOutcome::Succeeded => {
                stats.sessions_succeeded += 1;
                stats.last_sync_time = Some(Utc::now());
                info!(
                    batches = run.batches_sent,
                    records = run.records_uploaded,
                    retries = run.retries,
                    "sync session succeeded"
                );
                SyncState::Idle
            }
            SessionOutcome::Failed { kind, message } => {
                stats.sessions_failed += 1;
                stats.last_error = Some(message.clone());
                warn!(?kind, error = %message, "sync session failed");
                SyncState::Failed
            }
            SessionOutcome::Cancelled => {
                stats.sessions_cancelled += 1;
                info!("sync session cancelled");
                SyncState::Cancelled
            }
        };
        drop(stats);

        self.set_state(terminal);
        self.set_state(SyncState::Idle);
    }

    /// Marks `type_id` as failed unless it already is.
    fn fail_type(&self, run: &mut SessionRun, type_id: &DataTypeId, error: &SyncError) {
        if run.is_failed(type_id) {
            return;
        }
        warn!(%type_id, error = %error, "anchor not advanced");
        let (kind, message) = (error.kind(), error.to_string());
        run.first_error.get_or_insert_with(|| (kind, message.clone()));
        run.types.insert(
            type_id.clone(),
            TypeOutcome::Failed {
                kind,
                message: message.clone(),
            },
        );
        self.events.emit(SyncEvent::TypeFailed {
            session_id: run.id,
            type_id: type_id.clone(),
            kind,
            message,
        });
    }

    /// Runs collection, upload and commit. `Err` aborts the session.
    fn drive(&self, run: &mut SessionRun, cancel: &CancelFlag) -> Result<(), SyncError> {
        self.set_state(SyncState::Collecting);
        let mut sets = Vec::with_capacity(self.config.tracked_types.len());
        for type_id in &self.config.tracked_types {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let anchor = self.anchors.get(&self.endpoint, type_id);
            match self.collector.collect(type_id, anchor.as_ref()) {
                Ok(set) => {
                    self.events.emit(SyncEvent::TypeCollected {
                        session_id: run.id,
                        type_id: type_id.clone(),
                        records: set.len(),
                        full_export: set.full_export,
                    });
                    sets.push(set);
                }
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => self.fail_type(run, type_id, &e),
            }
        }

        let pending: Vec<Pending> = sets
            .iter()
            .map(|set| Pending {
                type_id: set.type_id.clone(),
                anchor: set.anchor.clone(),
                records: set.len(),
                full_export: set.full_export,
            })
            .collect();

        self.set_state(SyncState::Uploading);
        let batches = self.batcher.split(sets);
        debug!(batches = batches.len(), capacity = self.batcher.capacity(), "batches prepared");

        // Types whose last batch was accepted. Earlier batches of such a type
        // were accepted too, or the type would have failed.
        let mut delivered: HashSet<DataTypeId> = HashSet::new();

        for (position, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if batch.type_ids().all(|t| run.is_failed(t)) {
                debug!(batch = batch.index, "every type in batch already failed; skipped");
                continue;
            }

            let delivery = self.pipeline.send(batch, cancel);
            run.retries += delivery.retries();

            let error = match delivery.result {
                Ok(()) => {
                    debug!(
                        batch = batch.index,
                        records = batch.record_count(),
                        bytes = delivery.bytes,
                        "batch accepted"
                    );
                    run.batches_sent += 1;
                    run.records_uploaded += batch.record_count();
                    delivered.extend(batch.drains.iter().cloned());
                    self.events.emit(SyncEvent::BatchUploaded {
                        session_id: run.id,
                        index: batch.index,
                        records: batch.record_count(),
                        attempts: delivery.attempts,
                    });
                    continue;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => e,
            };

            warn!(batch = batch.index, records = batch.record_count(), error = %error, "batch failed");
            self.events.emit(SyncEvent::BatchFailed {
                session_id: run.id,
                index: batch.index,
                kind: error.kind(),
                message: error.to_string(),
            });

            if error.is_session_fatal() {
                return Err(error);
            }
            if let SyncError::PayloadTooLarge { records } = error {
                warn!(records, "server refused batch size; lower records_per_chunk");
                self.events.emit(SyncEvent::PayloadTooLarge {
                    session_id: run.id,
                    records,
                });
            }

            match error.kind() {
                // The endpoint is unreachable: later batches would only burn
                // more retries, so every type still waiting fails now.
                SyncErrorKind::TransportTransient | SyncErrorKind::TransportFatal => {
                    for remaining in &batches[position..] {
                        for type_id in remaining.type_ids() {
                            self.fail_type(run, type_id, &error);
                        }
                    }
                    break;
                }
                _ => {
                    for type_id in batch.type_ids() {
                        self.fail_type(run, type_id, &error);
                    }
                }
            }
        }

        self.set_state(SyncState::Committing);
        for item in pending {
            if run.is_failed(&item.type_id) {
                continue;
            }
            // An empty set has no batch and commits its new anchor directly.
            if item.records > 0 && !delivered.contains(&item.type_id) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match self.anchors.commit(&self.endpoint, &item.type_id, &item.anchor) {
                Ok(_) => {
                    self.events.emit(SyncEvent::AnchorCommitted {
                        session_id: run.id,
                        type_id: item.type_id.clone(),
                    });
                    run.types.insert(
                        item.type_id,
                        TypeOutcome::Committed {
                            records: item.records,
                            full_export: item.full_export,
                        },
                    );
                }
                Err(e) => self.fail_type(run, &item.type_id, &e),
            }
        }

        Ok(())
    }
}

impl<D: DataSource, U: Uploader> SessionRunner for Inner<D, U> {
    fn run(&self, trigger: SyncTrigger, cancel: &CancelFlag) -> SessionReport {
        self.run_session(trigger, cancel)
    }
}
