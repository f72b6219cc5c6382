//! Session bookkeeping: cancellation, triggers, per-endpoint exclusion and
//! reports.

use crate::endpoint::EndpointKey;
use crate::error::SyncErrorKind;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vitalsync_protocol::DataTypeId;

/// A shared cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What caused a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// An explicit `sync_now` call.
    Manual,
    /// A debounced data source change notification.
    Observer,
    /// The periodic catch-up task.
    Scheduled,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Observer => "observer",
            SyncTrigger::Scheduled => "scheduled",
        })
    }
}

/// Result of one data type within a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeOutcome {
    /// Every record was delivered and the anchor advanced.
    Committed {
        /// Records uploaded for this type.
        records: usize,
        /// Whether this was a full export.
        full_export: bool,
    },
    /// The anchor did not move.
    Failed {
        /// Error classification.
        kind: SyncErrorKind,
        /// Error message.
        message: String,
    },
    /// The session stopped before this type was finished.
    Skipped,
}

impl TypeOutcome {
    /// Returns true if the anchor advanced.
    pub fn is_committed(&self) -> bool {
        matches!(self, TypeOutcome::Committed { .. })
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Every tracked type was committed.
    Succeeded,
    /// At least one type failed, or the session was aborted.
    Failed {
        /// Classification of the first error.
        kind: SyncErrorKind,
        /// Message of the first error.
        message: String,
    },
    /// The session observed a cancellation request.
    Cancelled,
}

/// Summary of one finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Unique id of the session.
    pub session_id: Uuid,
    /// Endpoint the session uploaded to.
    pub endpoint: EndpointKey,
    /// What started the session.
    pub trigger: SyncTrigger,
    /// Overall outcome.
    pub outcome: SessionOutcome,
    /// Per-type outcomes, for every tracked type.
    pub types: BTreeMap<DataTypeId, TypeOutcome>,
    /// Batches accepted by the server.
    pub batches_sent: usize,
    /// Records accepted by the server.
    pub records_uploaded: usize,
    /// Retries spent on transient failures.
    pub retries: u32,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl SessionReport {
    /// Returns true if the session succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::Succeeded
    }

    /// Returns the outcome recorded for `type_id`.
    pub fn type_outcome(&self, type_id: &DataTypeId) -> Option<&TypeOutcome> {
        self.types.get(type_id)
    }
}

/// What happened to a sync request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Sessions ran on the caller's thread: the requested one, followed by a
    /// manual request queued while it was running, if any.
    Ran(Vec<SessionReport>),
    /// An automatic request arrived while a session was running and was
    /// merged into it.
    Coalesced,
    /// A manual request arrived while a session was running; it will run
    /// right after.
    Queued,
    /// A manual request arrived while another manual request was already
    /// queued.
    Dropped,
    /// The request was not admitted (no configuration, bad token, stopped).
    Refused(String),
}

impl RequestOutcome {
    /// Returns the reports of sessions that ran, if any.
    pub fn reports(&self) -> &[SessionReport] {
        match self {
            RequestOutcome::Ran(reports) => reports,
            _ => &[],
        }
    }
}

/// Something that can run a session for an endpoint.
///
/// Used to park a queued manual request in the endpoint's slot.
pub trait SessionRunner: Send + Sync {
    /// Runs one session with `trigger`.
    fn run(&self, trigger: SyncTrigger, cancel: &CancelFlag) -> SessionReport;
}

/// Per-endpoint single-flight slot.
struct Slot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    active: Option<CancelFlag>,
    queued: Option<Arc<dyn SessionRunner>>,
}

/// Admission result of [`SessionRegistry::try_begin`].
pub enum Admission {
    /// The caller owns the endpoint until the guard is dropped.
    Granted(SessionGuard),
    /// Another session is running.
    Busy,
}

/// Serializes sessions per endpoint.
///
/// At most one session runs for a given [`EndpointKey`]; at most one manual
/// request waits behind it. Different endpoints run independently.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<EndpointKey, Arc<Slot>>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, endpoint: &EndpointKey) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(Slot {
                state: Mutex::new(SlotState::default()),
            })
        }))
    }

    /// Claims the endpoint if no session is running for it.
    pub fn try_begin(&self, endpoint: &EndpointKey) -> Admission {
        let slot = self.slot(endpoint);
        let mut state = slot.state.lock();
        if state.active.is_some() {
            return Admission::Busy;
        }
        let cancel = CancelFlag::new();
        state.active = Some(cancel.clone());
        drop(state);

        Admission::Granted(SessionGuard {
            slot,
            cancel,
            endpoint: endpoint.clone(),
        })
    }

    /// Parks `runner` behind the running session.
    ///
    /// [`Enqueue::Idle`] means the endpoint went idle in the meantime and the
    /// caller should retry admission.
    pub fn enqueue(&self, endpoint: &EndpointKey, runner: Arc<dyn SessionRunner>) -> Enqueue {
        let slot = self.slot(endpoint);
        let mut state = slot.state.lock();
        if state.active.is_none() {
            return Enqueue::Idle;
        }
        if state.queued.is_some() {
            return Enqueue::Full;
        }
        state.queued = Some(runner);
        Enqueue::Queued
    }

    /// Returns true while a session runs for `endpoint`.
    pub fn is_busy(&self, endpoint: &EndpointKey) -> bool {
        self.slot(endpoint).state.lock().active.is_some()
    }

    /// Cancels the running session for `endpoint` and discards the queued
    /// request. Returns true if a session was running.
    pub fn cancel(&self, endpoint: &EndpointKey) -> bool {
        let slot = self.slot(endpoint);
        let mut state = slot.state.lock();
        state.queued = None;
        match &state.active {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Result of [`SessionRegistry::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The request will run after the current session.
    Queued,
    /// Another request is already queued.
    Full,
    /// No session is running.
    Idle,
}

/// Ownership of an endpoint's slot.
///
/// Dropping the guard releases the endpoint, even if the session panicked.
pub struct SessionGuard {
    slot: Arc<Slot>,
    cancel: CancelFlag,
    endpoint: EndpointKey,
}

impl SessionGuard {
    /// Returns the cancellation flag of the session holding the slot.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Returns the endpoint held.
    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    /// Takes the queued request, if any, and hands the slot to it.
    ///
    /// The slot stays claimed with a fresh cancellation flag, so nothing can
    /// slip in between two sessions. Returns `None` and releases nothing if
    /// the queue is empty.
    ///
    /// [`SessionRegistry::cancel`] empties the queue, so a request found here
    /// arrived after any cancellation and runs even if the current session
    /// was cancelled.
    pub fn take_queued(&mut self) -> Option<Arc<dyn SessionRunner>> {
        let mut state = self.slot.state.lock();
        let runner = state.queued.take()?;
        self.cancel = CancelFlag::new();
        state.active = Some(self.cancel.clone());
        Some(runner)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        state.active = None;
    }
}
