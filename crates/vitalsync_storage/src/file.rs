//! File-based key-value store for persistent state.

use crate::error::{StorageError, StorageResult};
use crate::store::KeyValueStore;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const VALUE_EXT: &str = "val";
const TEMP_EXT: &str = "tmp";

/// A directory-backed key-value store.
///
/// Every key is stored in its own file inside the store directory. The file
/// name is the hex encoding of the key, so arbitrary keys (including `/`)
/// are safe.
///
/// # Durability
///
/// `set` uses the write-then-rename pattern:
/// 1. Write the value to a temporary file
/// 2. Sync the temporary file to disk
/// 3. Rename it over the value file
/// 4. Fsync the directory so the rename itself is durable
///
/// A crash or error at any step leaves the previous value intact.
///
/// # Example
///
/// ```no_run
/// use vitalsync_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("state")).unwrap();
/// store.set("anchors/abc/steps", b"42").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes writers; readers may run concurrently.
    lock: RwLock<()>,
}

impl FileStore {
    /// Opens or creates a store rooted at `path`.
    ///
    /// Leftover temporary files from an interrupted write are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXT) {
                debug!(path = %entry_path.display(), "removing stale temp file");
                fs::remove_file(&entry_path)?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{VALUE_EXT}", encode_key(key)))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{TEMP_EXT}", encode_key(key)))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let _guard = self.lock.read();
        match fs::read(self.value_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let _guard = self.lock.write();
        let temp_path = self.temp_path(key);

        let written = (|| -> StorageResult<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(value)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, self.value_path(key))?;
        self.sync_directory()
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let _guard = self.lock.write();
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => {
                self.sync_directory()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let _guard = self.lock.read();
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry_path = entry?.path();
            if entry_path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = decode_key(stem)?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_key(name: &str) -> StorageResult<String> {
    if name.len() % 2 != 0 {
        return Err(StorageError::Corrupted(format!("odd-length key file name {name}")));
    }

    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&name[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| StorageError::Corrupted(format!("bad key file name {name}: {e}")))?;

    String::from_utf8(bytes)
        .map_err(|e| StorageError::Corrupted(format!("key is not UTF-8: {e}")))
}
