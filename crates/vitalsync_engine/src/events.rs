//! Structured sync events.
//!
//! Everything the engine logs through `tracing` is also offered to an
//! [`EventSink`], so an embedder can surface progress without parsing logs.

use crate::endpoint::EndpointKey;
use crate::error::SyncErrorKind;
use crate::session::{SessionOutcome, SyncTrigger};
use parking_lot::Mutex;
use uuid::Uuid;
use vitalsync_protocol::DataTypeId;

/// A notable step of a sync session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A session was admitted.
    SessionStarted {
        /// Session id.
        session_id: Uuid,
        /// Endpoint key.
        endpoint: EndpointKey,
        /// What started it.
        trigger: SyncTrigger,
    },
    /// Changes were collected for a type.
    TypeCollected {
        /// Session id.
        session_id: Uuid,
        /// Data type.
        type_id: DataTypeId,
        /// Records to upload.
        records: usize,
        /// Whether this is a full export.
        full_export: bool,
    },
    /// A batch was accepted by the server.
    BatchUploaded {
        /// Session id.
        session_id: Uuid,
        /// Batch index.
        index: usize,
        /// Records in the batch.
        records: usize,
        /// Requests made for it.
        attempts: u32,
    },
    /// A batch could not be delivered.
    BatchFailed {
        /// Session id.
        session_id: Uuid,
        /// Batch index.
        index: usize,
        /// Error classification.
        kind: SyncErrorKind,
        /// Error message.
        message: String,
    },
    /// The server refused a batch as too large.
    ///
    /// The configured records-per-chunk should be lowered.
    PayloadTooLarge {
        /// Session id.
        session_id: Uuid,
        /// Records in the refused batch.
        records: usize,
    },
    /// A type's anchor advanced.
    AnchorCommitted {
        /// Session id.
        session_id: Uuid,
        /// Data type.
        type_id: DataTypeId,
    },
    /// A type's anchor stays where it was.
    TypeFailed {
        /// Session id.
        session_id: Uuid,
        /// Data type.
        type_id: DataTypeId,
        /// Error classification.
        kind: SyncErrorKind,
        /// Error message.
        message: String,
    },
    /// A session ended.
    SessionFinished {
        /// Session id.
        session_id: Uuid,
        /// Overall outcome.
        outcome: SessionOutcome,
    },
    /// A configuration was refused when starting background sync.
    ConfigurationRejected {
        /// Why.
        message: String,
    },
    /// The user declined data source access.
    AuthorizationDenied,
}

/// Receives [`SyncEvent`]s.
///
/// Called synchronously on the session's thread; implementations should
/// return quickly.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: SyncEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Keeps every event in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event received so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Returns the events matching `predicate`.
    pub fn matching(&self, predicate: impl Fn(&SyncEvent) -> bool) -> Vec<SyncEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        sink.emit(SyncEvent::AuthorizationDenied);
        sink.emit(SyncEvent::ConfigurationRejected {
            message: "no types".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SyncEvent::AuthorizationDenied);
        assert_eq!(
            sink.matching(|e| matches!(e, SyncEvent::ConfigurationRejected { .. }))
                .len(),
            1
        );

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
