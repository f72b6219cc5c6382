//! In-memory key-value store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::KeyValueStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory key-value store.
///
/// This store keeps all values in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Hosts that persist anchors elsewhere
///
/// Failure injection is available through [`InMemoryStore::set_available`]
/// and [`InMemoryStore::set_fail_writes`], so callers can exercise their
/// persistence-error paths.
///
/// # Example
///
/// ```rust
/// use vitalsync_storage::{InMemoryStore, KeyValueStore};
///
/// let store = InMemoryStore::new();
/// store.set("a", b"1").unwrap();
/// assert_eq!(store.keys_with_prefix("").unwrap(), vec!["a".to_string()]);
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    available: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every operation fail with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes `set` and `delete` fail while reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory store disabled".into()))
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        self.check_writable()?;
        Ok(self.data.write().remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
