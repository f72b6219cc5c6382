//! Key-value store trait definition.

use crate::error::StorageResult;

/// A durable key-value store.
///
/// Stores are **opaque byte maps**. The sync engine owns the meaning of keys
/// and values; stores only guarantee persistence and atomic replacement.
///
/// # Invariants
///
/// - `get` returns exactly the bytes last passed to a successful `set`
/// - `set` is all-or-nothing: if it returns an error, a subsequent `get`
///   still observes the previous value
/// - `delete` of a missing key is not an error
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Atomically replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be made durable. The previous
    /// value, if any, is left in place.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Returns `true` if a value was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be made durable.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists all keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        (**self).delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }
}
