//! Trigger sources feeding the orchestrator.
//!
//! Data source notifications and the periodic catch-up task are two
//! independent producers. Both post into one bounded mailbox drained by a
//! single worker thread, which debounces notifications per type and turns
//! everything into [`SyncRequester::request_sync`] calls.

use crate::error::{SyncError, SyncResult};
use crate::scheduler::{TaskHandler, TaskScheduler};
use crate::session::{RequestOutcome, SyncTrigger};
use crate::source::{ChangeCallback, DataSource, SubscriptionId};
use crate::state::SyncOrchestrator;
use crate::transport::Uploader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use vitalsync_protocol::DataTypeId;

/// Mailbox slots. Notifications beyond this are dropped; the type is either
/// already pending or will be picked up by the next catch-up run.
const MAILBOX_CAPACITY: usize = 64;

/// Receiver of normalized sync requests.
pub trait SyncRequester: Send + Sync {
    /// Requests a session.
    fn request_sync(&self, trigger: SyncTrigger) -> RequestOutcome;
}

impl<D: DataSource + 'static, U: Uploader + 'static> SyncRequester for SyncOrchestrator<D, U> {
    fn request_sync(&self, trigger: SyncTrigger) -> RequestOutcome {
        SyncOrchestrator::request_sync(self, trigger)
    }
}

/// A message in the trigger mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// The data source reported a change for a type.
    Changed(DataTypeId),
    /// The periodic task fired.
    Scheduled,
    /// The worker should exit.
    Shutdown,
}

/// Settings of a [`TriggerManager`].
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    /// Types to observe.
    pub types: Vec<DataTypeId>,
    /// Window in which notifications for one type are merged.
    pub debounce: Duration,
    /// Interval of the catch-up task.
    pub periodic_interval: Duration,
    /// Id of the catch-up task in the scheduler.
    pub task_id: String,
}

/// Owns the subscriptions, the periodic registration and the worker.
pub struct TriggerManager<D: DataSource, S: TaskScheduler> {
    source: Arc<D>,
    scheduler: Arc<S>,
    task_id: String,
    subscriptions: Vec<SubscriptionId>,
    mailbox: SyncSender<TriggerEvent>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<D: DataSource, S: TaskScheduler> TriggerManager<D, S> {
    /// Subscribes to every type, registers the catch-up task and starts the
    /// worker.
    ///
    /// On error nothing stays registered.
    pub fn start(
        source: Arc<D>,
        scheduler: Arc<S>,
        requester: Arc<dyn SyncRequester>,
        settings: TriggerSettings,
    ) -> SyncResult<Self> {
        let (mailbox, inbox) = mpsc::sync_channel(MAILBOX_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_shutdown = Arc::clone(&shutdown);
        let debounce = settings.debounce;
        let worker = std::thread::Builder::new()
            .name("vitalsync-triggers".into())
            .spawn(move || run_worker(inbox, requester, debounce, worker_shutdown))
            .map_err(|e| SyncError::Configuration(format!("cannot spawn trigger worker: {e}")))?;

        let mut manager = Self {
            source,
            scheduler,
            task_id: settings.task_id.clone(),
            subscriptions: Vec::with_capacity(settings.types.len()),
            mailbox,
            shutdown,
            worker: Some(worker),
        };

        if let Err(e) = manager.register(&settings) {
            manager.stop();
            return Err(e);
        }

        info!(
            types = settings.types.len(),
            debounce_ms = settings.debounce.as_millis() as u64,
            interval_s = settings.periodic_interval.as_secs(),
            "background triggers started"
        );
        Ok(manager)
    }

    fn register(&mut self, settings: &TriggerSettings) -> SyncResult<()> {
        for type_id in &settings.types {
            let mailbox = self.mailbox.clone();
            let callback: ChangeCallback = Arc::new(move |type_id: &DataTypeId| {
                post(&mailbox, TriggerEvent::Changed(type_id.clone()));
            });
            let id = self.source.subscribe(type_id, callback)?;
            self.subscriptions.push(id);
        }

        let mailbox = self.mailbox.clone();
        let handler: TaskHandler = Arc::new(move || post(&mailbox, TriggerEvent::Scheduled));
        self.scheduler
            .register_periodic(&self.task_id, settings.periodic_interval, handler)
    }

    /// Returns true until [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Removes every registration and waits for the worker to exit.
    ///
    /// A session already started by the worker runs to its end; cancel it
    /// first to make this return quickly.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);

        for id in self.subscriptions.drain(..) {
            self.source.unsubscribe(id);
        }
        self.scheduler.cancel(&self.task_id);

        // If the mailbox is full the worker sees the flag after its next event.
        let _ = self.mailbox.try_send(TriggerEvent::Shutdown);
        if worker.join().is_err() {
            warn!("trigger worker panicked");
        }
        info!("background triggers stopped");
    }
}

impl<D: DataSource, S: TaskScheduler> Drop for TriggerManager<D, S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn post(mailbox: &SyncSender<TriggerEvent>, event: TriggerEvent) {
    match mailbox.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => trace!(?event, "trigger mailbox full; event dropped"),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn run_worker(
    inbox: Receiver<TriggerEvent>,
    requester: Arc<dyn SyncRequester>,
    debounce: Duration,
    shutdown: Arc<AtomicBool>,
) {
    // Type -> time at which its merged notification is due.
    let mut pending: HashMap<DataTypeId, Instant> = HashMap::new();

    while !shutdown.load(Ordering::SeqCst) {
        let next_due = pending.values().min().copied();
        let received = match next_due {
            Some(due) => inbox.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(TriggerEvent::Changed(type_id)) => {
                pending
                    .entry(type_id)
                    .or_insert_with(|| Instant::now() + debounce);
            }
            Ok(TriggerEvent::Scheduled) if !shutdown.load(Ordering::SeqCst) => {
                debug!("catch-up task fired");
                requester.request_sync(SyncTrigger::Scheduled);
            }
            Ok(TriggerEvent::Scheduled | TriggerEvent::Shutdown)
            | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // A session collects every tracked type, so once one type is due
        // the others pending are served by the same request.
        let now = Instant::now();
        if pending.values().any(|at| *at <= now) {
            let types: Vec<DataTypeId> = pending.drain().map(|(t, _)| t).collect();
            debug!(types = ?types, "debounced change notifications");
            requester.request_sync(SyncTrigger::Observer);
        }
    }
}
