//! Periodic task scheduling.
//!
//! On mobile hosts the operating system owns background scheduling and the
//! embedder adapts it to [`TaskScheduler`]. [`ThreadScheduler`] is a plain
//! thread-based implementation for hosts without one.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Work run by a scheduler.
pub type TaskHandler = Arc<dyn Fn() + Send + Sync>;

/// Registers periodic background work.
pub trait TaskScheduler: Send + Sync {
    /// Runs `handler` every `interval` until [`cancel`](Self::cancel) is
    /// called with `id`. Registering an id again replaces the previous task.
    fn register_periodic(&self, id: &str, interval: Duration, handler: TaskHandler)
        -> SyncResult<()>;

    /// Stops the task registered under `id`. Unknown ids are ignored.
    fn cancel(&self, id: &str);
}

struct ThreadTask {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs every periodic task on its own thread.
#[derive(Default)]
pub struct ThreadScheduler {
    tasks: Mutex<HashMap<String, ThreadTask>>,
}

impl ThreadScheduler {
    /// Creates a scheduler with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn stop(task: ThreadTask) {
        // A send error means the thread is already gone.
        let _ = task.stop.send(());
        if task.handle.join().is_err() {
            warn!("periodic task panicked");
        }
    }
}

impl TaskScheduler for ThreadScheduler {
    fn register_periodic(
        &self,
        id: &str,
        interval: Duration,
        handler: TaskHandler,
    ) -> SyncResult<()> {
        if interval.is_zero() {
            return Err(SyncError::Configuration(
                "periodic interval must be greater than zero".into(),
            ));
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let name = format!("vitalsync-{id}");
        let task_id = id.to_string();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        debug!(task = %task_id, "periodic task fired");
                        handler();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| SyncError::Configuration(format!("cannot spawn scheduler thread: {e}")))?;

        let previous = self
            .tasks
            .lock()
            .insert(id.to_string(), ThreadTask { stop, handle });
        if let Some(task) = previous {
            Self::stop(task);
        }
        Ok(())
    }

    fn cancel(&self, id: &str) {
        let task = self.tasks.lock().remove(id);
        if let Some(task) = task {
            Self::stop(task);
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            Self::stop(task);
        }
    }
}

/// A scheduler that only runs tasks when told to. Used by tests.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<HashMap<String, (Duration, TaskHandler)>>,
}

impl ManualScheduler {
    /// Creates a scheduler with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the task registered under `id` once. Returns false if there is
    /// none.
    pub fn fire(&self, id: &str) -> bool {
        let handler = self.tasks.lock().get(id).map(|(_, h)| Arc::clone(h));
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Returns true if a task is registered under `id`.
    pub fn is_registered(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }

    /// Returns the interval of the task registered under `id`.
    pub fn interval(&self, id: &str) -> Option<Duration> {
        self.tasks.lock().get(id).map(|(interval, _)| *interval)
    }
}

impl TaskScheduler for ManualScheduler {
    fn register_periodic(
        &self,
        id: &str,
        interval: Duration,
        handler: TaskHandler,
    ) -> SyncResult<()> {
        self.tasks
            .lock()
            .insert(id.to_string(), (interval, handler));
        Ok(())
    }

    fn cancel(&self, id: &str) {
        self.tasks.lock().remove(id);
    }
}

impl<S: TaskScheduler + ?Sized> TaskScheduler for Arc<S> {
    fn register_periodic(
        &self,
        id: &str,
        interval: Duration,
        handler: TaskHandler,
    ) -> SyncResult<()> {
        (**self).register_periodic(id, interval, handler)
    }

    fn cancel(&self, id: &str) {
        (**self).cancel(id)
    }
}
