//! The host-facing sync service.
//!
//! [`SyncService`] is the surface a host binding calls into. Its operations
//! never return errors: failures become a boolean or a
//! [`RequestOutcome`], and details go to the log and the [`EventSink`].

use crate::anchor::{Anchor, AnchorStore};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::{EventSink, NullEventSink, SyncEvent};
use crate::scheduler::TaskScheduler;
use crate::session::{Admission, RequestOutcome, SessionRegistry, SessionRunner, SyncTrigger};
use crate::source::DataSource;
use crate::state::{SyncOrchestrator, SyncState, SyncStats};
use crate::transport::Uploader;
use crate::trigger::{SyncRequester, TriggerManager, TriggerSettings};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vitalsync_protocol::DataTypeId;
use vitalsync_storage::KeyValueStore;

/// Poll interval while waiting for a cancelled session to release its
/// endpoint.
const RELEASE_POLL: Duration = Duration::from_millis(10);

struct Active<D: DataSource, U: Uploader, S: TaskScheduler> {
    orchestrator: SyncOrchestrator<D, U>,
    triggers: Option<TriggerManager<D, S>>,
}

/// Incremental sync of a local data source to one endpoint.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use vitalsync_engine::{
///     ManualScheduler, MemoryDataSource, MockUploader, SyncConfig, SyncService,
/// };
/// use vitalsync_storage::InMemoryStore;
///
/// let service = SyncService::new(
///     Arc::new(MemoryDataSource::new()),
///     Arc::new(MockUploader::new()),
///     Arc::new(ManualScheduler::new()),
///     Arc::new(InMemoryStore::new()),
/// );
///
/// service.initialize(
///     SyncConfig::new("https://ingest.example.com/v1/samples", "token").with_type("steps"),
/// );
/// assert!(service.start_background_sync());
/// assert_eq!(service.sync_now().reports().len(), 1);
/// service.stop_background_sync();
/// ```
pub struct SyncService<D: DataSource, U: Uploader, S: TaskScheduler> {
    source: Arc<D>,
    uploader: Arc<U>,
    scheduler: Arc<S>,
    anchors: Arc<AnchorStore>,
    registry: SessionRegistry,
    events: Arc<dyn EventSink>,
    current: RwLock<Option<Active<D, U, S>>>,
}

impl<D, U, S> SyncService<D, U, S>
where
    D: DataSource + 'static,
    U: Uploader + 'static,
    S: TaskScheduler + 'static,
{
    /// Creates a service with no configuration.
    pub fn new(
        source: Arc<D>,
        uploader: Arc<U>,
        scheduler: Arc<S>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            source,
            uploader,
            scheduler,
            anchors: Arc::new(AnchorStore::new(store)),
            registry: SessionRegistry::new(),
            events: Arc::new(NullEventSink),
            current: RwLock::new(None),
        }
    }

    /// Sends events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares per-endpoint exclusion with other services using `registry`.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Installs `config`, replacing the previous configuration.
    ///
    /// A session running under the previous configuration is cancelled and
    /// its background triggers are stopped; background sync has to be
    /// started again.
    pub fn initialize(&self, config: SyncConfig) {
        let mut current = self.current.write();
        if let Some(previous) = current.take() {
            Self::shut_down(previous);
        }

        info!(
            endpoint = %config.endpoint_key(),
            types = config.tracked_types.len(),
            records_per_chunk = config.records_per_chunk,
            "sync configured"
        );

        let orchestrator = SyncOrchestrator::new(
            config,
            Arc::clone(&self.source),
            Arc::clone(&self.uploader),
            Arc::clone(&self.anchors),
            self.registry.clone(),
            Arc::clone(&self.events),
        );
        *current = Some(Active {
            orchestrator,
            triggers: None,
        });
    }

    /// Asks the user for read access to the tracked types.
    pub fn request_authorization(&self) -> bool {
        let Some(types) = self.tracked_types() else {
            self.reject("sync is not configured");
            return false;
        };

        match self.source.request_authorization(&types) {
            Ok(true) => {
                info!(types = types.len(), "data source access granted");
                true
            }
            Ok(false) => {
                warn!("data source access declined");
                self.events.emit(SyncEvent::AuthorizationDenied);
                false
            }
            Err(e) => {
                warn!(error = %e, "authorization request failed");
                self.events.emit(SyncEvent::AuthorizationDenied);
                false
            }
        }
    }

    /// Starts observing the data source and the periodic catch-up task.
    ///
    /// Returns false if there is no valid configuration or the data source
    /// is not available. Calling it while already running returns true.
    pub fn start_background_sync(&self) -> bool {
        let mut current = self.current.write();
        let Some(active) = current.as_mut() else {
            self.reject("sync is not configured");
            return false;
        };

        if active.triggers.is_some() {
            return true;
        }

        let config = active.orchestrator.config().clone();
        if let Err(e) = config.validate() {
            self.reject(&e.to_string());
            return false;
        }
        if !self.source.is_available() {
            self.reject("data source is not available on this device");
            return false;
        }

        let requester: Arc<dyn SyncRequester> = Arc::new(active.orchestrator.clone());
        let settings = TriggerSettings {
            types: config.tracked_types.clone(),
            debounce: config.debounce,
            periodic_interval: config.periodic_interval,
            task_id: format!("vitalsync-catch-up-{}", config.endpoint_key()),
        };

        match TriggerManager::start(
            Arc::clone(&self.source),
            Arc::clone(&self.scheduler),
            requester,
            settings,
        ) {
            Ok(triggers) => {
                active.triggers = Some(triggers);
                true
            }
            Err(e) => {
                warn!(error = %e, "cannot start background sync");
                false
            }
        }
    }

    /// Runs a session now, or queues one if a session is running.
    pub fn sync_now(&self) -> RequestOutcome {
        let Some(orchestrator) = self.orchestrator() else {
            self.reject("sync is not configured");
            return RequestOutcome::Refused("sync is not configured".into());
        };
        if let Err(e) = orchestrator.config().validate() {
            self.reject(&e.to_string());
            return RequestOutcome::Refused(e.to_string());
        }
        orchestrator.request_sync(SyncTrigger::Manual)
    }

    /// Stops background triggers and cancels the running session.
    ///
    /// Any queued manual request is discarded. The configuration stays.
    pub fn stop_background_sync(&self) {
        let mut current = self.current.write();
        if let Some(active) = current.as_mut() {
            active.orchestrator.cancel();
            if let Some(mut triggers) = active.triggers.take() {
                triggers.stop();
            }
        }
    }

    /// Deletes every anchor of the configured endpoint, so the next session
    /// performs a full export of every tracked type.
    ///
    /// A running session for the endpoint is cancelled first and the reset
    /// waits until it has released the endpoint.
    pub fn reset_anchors(&self) -> bool {
        let Some(orchestrator) = self.orchestrator() else {
            self.reject("sync is not configured");
            return false;
        };
        let endpoint = orchestrator.endpoint().clone();

        orchestrator.cancel();
        let mut guard = loop {
            match self.registry.try_begin(&endpoint) {
                Admission::Granted(guard) => break guard,
                Admission::Busy => std::thread::sleep(RELEASE_POLL),
            }
        };

        let reset = match self.anchors.reset_all(&endpoint) {
            Ok(removed) => {
                info!(%endpoint, removed, "anchors reset; next sync is a full export");
                true
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "anchor reset failed");
                false
            }
        };

        // A manual request that arrived during the reset waited on our slot.
        while let Some(queued) = guard.take_queued() {
            queued.run(SyncTrigger::Manual, guard.cancel_flag());
        }
        reset
    }

    /// Returns the orchestrator state, or `Idle` without configuration.
    pub fn state(&self) -> SyncState {
        self.orchestrator()
            .map_or(SyncState::Idle, |o| o.state())
    }

    /// Returns statistics for the current configuration.
    pub fn stats(&self) -> SyncStats {
        self.orchestrator().map(|o| o.stats()).unwrap_or_default()
    }

    /// Returns the current configuration.
    pub fn config(&self) -> Option<SyncConfig> {
        self.orchestrator().map(|o| o.config().clone())
    }

    /// Returns true while background triggers are active.
    pub fn is_background_running(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|a| a.triggers.is_some())
    }

    /// Lists the anchors stored for the configured endpoint.
    pub fn anchors(&self) -> SyncResult<Vec<(DataTypeId, Anchor)>> {
        match self.orchestrator() {
            Some(o) => self.anchors.list(o.endpoint()),
            None => Ok(Vec::new()),
        }
    }

    fn orchestrator(&self) -> Option<SyncOrchestrator<D, U>> {
        self.current.read().as_ref().map(|a| a.orchestrator.clone())
    }

    fn tracked_types(&self) -> Option<Vec<DataTypeId>> {
        self.current
            .read()
            .as_ref()
            .map(|a| a.orchestrator.config().tracked_types.clone())
    }

    fn reject(&self, message: &str) {
        warn!(reason = message, "sync request rejected");
        self.events.emit(SyncEvent::ConfigurationRejected {
            message: message.to_string(),
        });
    }

    fn shut_down(active: Active<D, U, S>) {
        active.orchestrator.cancel();
        if let Some(mut triggers) = active.triggers {
            triggers.stop();
        }
    }
}
