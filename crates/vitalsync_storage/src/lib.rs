//! # vitalsync Storage
//!
//! Durable key-value persistence for vitalsync.
//!
//! This crate provides the lowest-level storage abstraction used by the sync
//! engine to keep its cursors (anchors). Stores are **opaque byte maps** -
//! they do not interpret the values they hold.
//!
//! ## Design Principles
//!
//! - Stores are simple keyed byte maps (get, set, delete, prefix scan)
//! - `set` replaces a value atomically: a failed write leaves the previous
//!   value readable
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral state
//! - [`FileStore`] - One file per key, written with write-then-rename
//!
//! ## Example
//!
//! ```rust
//! use vitalsync_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.set("anchors/abc/steps", b"42").unwrap();
//! assert_eq!(store.get("anchors/abc/steps").unwrap(), Some(b"42".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::KeyValueStore;
