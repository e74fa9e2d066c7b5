//! Directory-backed key-value store.

use crate::backend::KeyValueStore;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

/// A file-based key-value store.
///
/// Each key is stored in its own file inside a directory. Values survive
/// process restarts, and several processes may share the directory.
///
/// # Durability
///
/// - `set` writes a temporary file, syncs it, then renames it over the
///   previous value, so readers never observe a partial write
/// - Writers serialize on an exclusive lock file in the directory
///
/// This store has no change notifications; replicas sharing a directory
/// discover each other's writes by polling.
///
/// # Example
///
/// ```no_run
/// use tabsync_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("replica-data")).unwrap();
/// store.set("tabsync:last_update", "1700000000000").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens or creates a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is not a
    /// directory.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        if !dir.is_dir() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", dir.display()),
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(encode_key(key)))
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> StorageResult<T>) -> StorageResult<T> {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;
        let result = f();
        lock.unlock()?;
        result
    }
}

/// Maps a key to a file name: ASCII alphanumerics, `-` and `_` pass through,
/// everything else becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StorageError::Corrupted {
                    key: key.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        let tmp = path.with_extension("tmp");
        self.with_lock(|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        self.with_lock(|| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
    }
}
