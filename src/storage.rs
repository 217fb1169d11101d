//! Key/value storage the fabric table persists into.
//!
//! Implementations must keep "key not present" ([ErrorCode::KeyNotFound])
//! distinct from every other failure ([ErrorCode::StorageIo]); the fabric
//! table treats the former as an empty slot and propagates the latter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::error::ErrorCode;

pub trait PersistentStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile storage. Reads and writes can be made to fail for testing error paths.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.map
            .lock()
            .map_err(|_| anyhow::Error::new(ErrorCode::StorageIo).context("storage lock poisoned"))
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ErrorCode::StorageIo).context(format!("injected {} failure", op));
        }
        Ok(())
    }
}

impl PersistentStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.check(&self.fail_reads, "read")?;
        self.lock()?
            .get(key)
            .cloned()
            .ok_or(ErrorCode::KeyNotFound)
            .with_context(|| format!("key {}", key))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check(&self.fail_writes, "write")?;
        self.lock()?.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check(&self.fail_writes, "delete")?;
        match self.lock()?.remove(key) {
            Some(_) => Ok(()),
            None => Err(ErrorCode::KeyNotFound).context(format!("key {}", key)),
        }
    }
}

/// One file per key inside a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) the storage directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::Error::new(e).context(ErrorCode::StorageIo))
            .with_context(|| format!("creating storage directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(ErrorCode::InvalidArgument).context(format!("bad storage key {:?}", key));
        }
        Ok(self.dir.join(key))
    }
}

fn io_error(e: std::io::Error, key: &str) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        anyhow::Error::new(ErrorCode::KeyNotFound).context(format!("key {}", key))
    } else {
        anyhow::Error::new(e)
            .context(ErrorCode::StorageIo)
            .context(format!("key {}", key))
    }
}

impl PersistentStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        std::fs::read(self.path(key)?).map_err(|e| io_error(e, key))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).map_err(|e| io_error(e, key))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(e, key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.path(key)?).map_err(|e| io_error(e, key))
    }
}
