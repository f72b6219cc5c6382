//! # vitalsync Engine
//!
//! Incremental, anchor-based upload of time-series records from a local data
//! source to a remote endpoint.
//!
//! This crate provides:
//! - Per-endpoint, per-type anchors (durable change cursors)
//! - Change collection with full export on first run
//! - Bounded batching and a sequential, retrying upload pipeline
//! - A session state machine with single-flight execution per endpoint
//! - Debounced observer and periodic triggers
//!
//! ## Architecture
//!
//! A session runs **collect → batch → upload → commit**:
//! 1. Every tracked type is queried from its stored anchor, or in full if
//!    there is none
//! 2. The collected records are packed into bounded batches
//! 3. Batches are posted one after another
//! 4. A type's anchor advances only after every batch carrying its records
//!    was accepted
//!
//! ## Key Invariants
//!
//! - Anchors never move past data the server has not confirmed
//! - Delivery is at-least-once per anchor commit
//! - At most one session runs per endpoint; at most one manual request waits
//! - Endpoints never share anchors

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod anchor;
mod batcher;
mod collector;
mod config;
mod endpoint;
mod error;
mod events;
mod scheduler;
mod service;
mod session;
mod source;
mod state;
mod transport;
mod trigger;
mod upload;

pub use anchor::{Anchor, AnchorStore, AnchorToken};
pub use batcher::{BatchEntry, Batcher, UploadBatch};
pub use collector::{ChangeCollector, RecordSet};
pub use config::{RetryConfig, SyncConfig};
pub use endpoint::EndpointKey;
pub use error::{SyncError, SyncErrorKind, SyncResult};
pub use events::{EventSink, NullEventSink, RecordingEventSink, SyncEvent};
pub use scheduler::{ManualScheduler, TaskHandler, TaskScheduler, ThreadScheduler};
pub use service::SyncService;
pub use session::{
    Admission, CancelFlag, Enqueue, RequestOutcome, SessionGuard, SessionOutcome,
    SessionRegistry, SessionReport, SessionRunner, SyncTrigger, TypeOutcome,
};
pub use source::{
    ChangeCallback, DataSource, MemoryDataSource, QueryResult, SourceChange, SubscriptionId,
};
pub use state::{SyncOrchestrator, SyncState, SyncStats};
pub use transport::{MockReply, MockUploader, UploadRequest, UploadResponse, Uploader};
pub use trigger::{SyncRequester, TriggerEvent, TriggerManager, TriggerSettings};
pub use upload::{classify, Delivery, UploadPipeline};
