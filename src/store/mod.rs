//! Durable tier. Keys and values arrive already encoded as bytes.

pub mod log;
pub mod memory;
pub mod profiled;
pub mod redb;

pub use self::log::LogStore;
pub use self::memory::MemoryStore;
pub use self::profiled::{ProfiledStore, StoreOp};
pub use self::redb::RedbStore;

use std::fs;
use std::path::Path;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

pub trait Store: Send {
    /// Inserts or updates a key-value pair.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Retrieves the value for a given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Deletes the key. Returns whether it was present.
    fn remove(&mut self, key: &[u8]) -> Result<bool>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Deletes every entry.
    fn clear(&mut self) -> Result<()>;

    /// Bytes currently occupied on disk by the store's location.
    fn size_on_disk(&self) -> Result<u64>;

    /// Makes every write durable and releases the location. Calling it
    /// again is a no-op.
    fn close(&mut self) -> Result<()>;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        (**self).remove(key)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        (**self).contains(key)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }

    fn size_on_disk(&self) -> Result<u64> {
        (**self).size_on_disk()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Builds the store described by `config`.
pub fn open(config: &StoreConfig) -> Result<Box<dyn Store>> {
    config.validate()?;
    let store: Box<dyn Store> = match config.backend {
        StoreBackend::Memory => Box::new(MemoryStore::new()),
        StoreBackend::Log => Box::new(LogStore::open(&config.dir, config.delete_on_close)?),
        StoreBackend::Redb => Box::new(RedbStore::open(
            &config.dir,
            &config.table,
            config.delete_on_close,
        )?),
    };
    Ok(match config.reporting_interval {
        Some(interval) => Box::new(ProfiledStore::new(store, interval)),
        None => store,
    })
}

/// Prepares `dir` as a store location and runs `open` on it.
///
/// The directory is created if missing. If `open` fails, a directory created
/// here is removed again so a failed open leaves nothing behind.
pub(crate) fn with_location<T>(dir: &Path, open: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let created = if dir.exists() {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "store location is not a directory: {}",
                dir.display()
            )));
        }
        false
    } else {
        fs::create_dir_all(dir)?;
        true
    };

    open(dir).map_err(|e| {
        if created {
            if let Err(rm) = fs::remove_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %rm, "Failed to remove store location");
            }
        }
        e
    })
}

/// Deletes a location after its store released it.
pub(crate) fn remove_location(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            tracing::debug!(dir = %dir.display(), "Deleted store location");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Total size of all files under `dir`.
pub(crate) fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
