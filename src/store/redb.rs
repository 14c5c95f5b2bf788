use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ::redb::{Database, ReadableTable, TableDefinition};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::{dir_size, remove_location, with_location, Store};
use crate::error::{Error, Result};
use crate::flock::FileLock;

pub const DB_FILE: &str = "store.redb";

type Bytes = &'static [u8];

/// Open environments by canonical location. Stores in one process share the
/// database handle of their location; the file lock keeps other processes out.
static ENVIRONMENTS: OnceCell<Mutex<HashMap<PathBuf, Weak<Environment>>>> = OnceCell::new();

fn environments() -> &'static Mutex<HashMap<PathBuf, Weak<Environment>>> {
    ENVIRONMENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A redb database file and the lock on its location.
struct Environment {
    key: PathBuf,
    dir: PathBuf,
    db: Database,
    tables: Mutex<HashSet<String>>,
    _lock: FileLock,
}

impl Environment {
    /// Returns the open environment for `dir`, opening it if no store in this
    /// process holds it.
    fn acquire(dir: &Path) -> Result<Arc<Self>> {
        let key = dir.canonicalize()?;
        let mut registry = environments().lock();
        if let Some(env) = registry.get(&key).and_then(Weak::upgrade) {
            return Ok(env);
        }
        registry.retain(|_, env| env.strong_count() > 0);

        let lock = FileLock::acquire(dir)?;
        let db = Database::create(dir.join(DB_FILE)).map_err(redb_err)?;
        let env = Arc::new(Self {
            key: key.clone(),
            dir: dir.to_path_buf(),
            db,
            tables: Mutex::new(HashSet::new()),
            _lock: lock,
        });
        registry.insert(key, Arc::downgrade(&env));
        Ok(env)
    }

    fn claim(&self, table: &str) -> Result<()> {
        if self.tables.lock().insert(table.to_string()) {
            Ok(())
        } else {
            Err(Error::LocationInUse(self.dir.join(table)))
        }
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        let result = (|| -> std::result::Result<(), ::redb::Error> {
            let txn = self.db.begin_write()?;
            txn.delete_table(TableDefinition::<Bytes, Bytes>::new(table))?;
            txn.commit()?;
            Ok(())
        })();
        result.map_err(Error::Redb)
    }

    /// Gives up one handle on the environment. The last handle closes the
    /// database, and removes the location if `remove` is set.
    fn detach(env: Arc<Self>, remove: bool) -> Result<()> {
        // Held until the location is gone so no open can revive it meanwhile.
        let mut registry = environments().lock();
        if Arc::strong_count(&env) > 1 {
            return Ok(());
        }
        registry.remove(&env.key);
        let dir = env.dir.clone();
        drop(env);
        tracing::debug!(dir = %dir.display(), "Closed redb environment");
        if remove {
            remove_location(&dir)?;
        }
        Ok(())
    }
}

/// Store backed by one named table of a redb database file.
///
/// Stores opened on the same location share the database. A table can be
/// held by one store at a time.
pub struct RedbStore {
    env: Option<Arc<Environment>>,
    dir: PathBuf,
    table: String,
    delete_on_close: bool,
}

fn redb_err(e: impl Into<::redb::Error>) -> Error {
    Error::Redb(e.into())
}

impl RedbStore {
    pub fn open(dir: &Path, table: &str, delete_on_close: bool) -> Result<Self> {
        with_location(dir, |dir| {
            let env = Environment::acquire(dir)?;
            if let Err(e) = env.claim(table) {
                Environment::detach(env, false)?;
                return Err(e);
            }

            let store = Self {
                env: Some(env),
                dir: dir.to_path_buf(),
                table: table.to_string(),
                delete_on_close,
            };
            // Create the table up front so readers never see it missing.
            store.write(|_| Ok(()))?;

            tracing::debug!(dir = %dir.display(), table, "Opened redb store");
            Ok(store)
        })
    }

    fn definition(&self) -> TableDefinition<'_, Bytes, Bytes> {
        TableDefinition::new(&self.table)
    }

    fn db(&self) -> Result<&Database> {
        self.env
            .as_ref()
            .map(|env| &env.db)
            .ok_or_else(|| Error::Config(format!("redb store {} is closed", self.dir.display())))
    }

    /// Runs `f` against the table inside one committed write transaction.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut ::redb::Table<'_, '_, Bytes, Bytes>) -> std::result::Result<T, ::redb::Error>,
    ) -> Result<T> {
        let db = self.db()?;
        let result = (|| -> std::result::Result<T, ::redb::Error> {
            let txn = db.begin_write()?;
            let out = {
                let mut table = txn.open_table(self.definition())?;
                f(&mut table)?
            };
            txn.commit()?;
            Ok(out)
        })();
        result.map_err(Error::Redb)
    }

    /// Hands the table back to the environment, dropping it first if `delete`.
    fn release(&mut self, delete: bool) -> Result<()> {
        let env = match self.env.take() {
            Some(env) => env,
            None => return Ok(()),
        };
        let dropped = if delete {
            env.drop_table(&self.table)
        } else {
            Ok(())
        };
        env.tables.lock().remove(&self.table);
        let detached = Environment::detach(env, delete);
        dropped.and(detached)
    }
}

impl Store for RedbStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|table| {
            table.insert(key, value)?;
            Ok(())
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(redb_err)?;
        let table = txn.open_table(self.definition()).map_err(redb_err)?;
        let value = table.get(key).map_err(redb_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.write(|table| Ok(table.remove(key)?.is_some()))
    }

    fn clear(&mut self) -> Result<()> {
        let db = self.db()?;
        let result = (|| -> std::result::Result<(), ::redb::Error> {
            let txn = db.begin_write()?;
            txn.delete_table(self.definition())?;
            txn.open_table(self.definition())?;
            txn.commit()?;
            Ok(())
        })();
        result.map_err(Error::Redb)
    }

    /// Size of the whole location, shared with any other table in it.
    fn size_on_disk(&self) -> Result<u64> {
        dir_size(&self.dir)
    }

    fn close(&mut self) -> Result<()> {
        if self.env.is_none() {
            return Ok(());
        }
        let delete = self.delete_on_close;
        self.release(delete)?;
        tracing::debug!(dir = %self.dir.display(), table = %self.table, "Closed redb store");
        Ok(())
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        if let Err(e) = self.release(false) {
            tracing::warn!(
                dir = %self.dir.display(),
                table = %self.table,
                error = %e,
                "Failed to release redb store"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = RedbStore::open(dir.path(), "artifacts", false).unwrap();
            store.put(b"/etc/passwd", b"read").unwrap();
            store.put(b"/tmp/out", b"written").unwrap();
            assert!(store.remove(b"/tmp/out").unwrap());
            assert!(!store.remove(b"/tmp/out").unwrap());
            store.close().unwrap();
        }

        let store = RedbStore::open(dir.path(), "artifacts", false).unwrap();
        assert_eq!(store.get(b"/etc/passwd").unwrap(), Some(b"read".to_vec()));
        assert!(!store.contains(b"/tmp/out").unwrap());
    }

    #[test]
    fn test_tables_share_a_location() {
        let dir = TempDir::new().unwrap();
        let mut first = RedbStore::open(dir.path(), "first", false).unwrap();
        let mut second = RedbStore::open(dir.path(), "second", false).unwrap();

        first.put(b"k", b"one").unwrap();
        second.put(b"k", b"two").unwrap();
        assert_eq!(first.get(b"k").unwrap(), Some(b"one".to_vec()));
        assert_eq!(second.get(b"k").unwrap(), Some(b"two".to_vec()));

        second.clear().unwrap();
        assert_eq!(first.get(b"k").unwrap(), Some(b"one".to_vec()));
        assert_eq!(second.get(b"k").unwrap(), None);

        first.close().unwrap();
        second.put(b"after", b"first closed").unwrap();
        second.close().unwrap();

        let reopened = RedbStore::open(dir.path(), "second", false).unwrap();
        assert_eq!(reopened.get(b"after").unwrap(), Some(b"first closed".to_vec()));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut store = RedbStore::open(dir.path(), "entries", false).unwrap();
        for i in 0u8..50 {
            store.put(&[i], &[i; 32]).unwrap();
        }
        store.clear().unwrap();

        assert_eq!(store.get(&[7]).unwrap(), None);
        store.put(b"after", b"clear").unwrap();
        assert_eq!(store.get(b"after").unwrap(), Some(b"clear".to_vec()));
    }

    #[test]
    fn test_table_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let mut first = RedbStore::open(dir.path(), "entries", false).unwrap();
        assert!(matches!(
            RedbStore::open(dir.path(), "entries", false),
            Err(Error::LocationInUse(_))
        ));
        first.close().unwrap();
        assert!(RedbStore::open(dir.path(), "entries", false).is_ok());
    }

    #[test]
    fn test_dropped_store_releases_its_table() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path(), "entries", false).unwrap();
        drop(store);
        assert!(RedbStore::open(dir.path(), "entries", false).is_ok());
    }

    #[test]
    fn test_location_stays_locked_while_any_table_is_open() {
        let dir = TempDir::new().unwrap();
        let mut first = RedbStore::open(dir.path(), "first", false).unwrap();
        let mut second = RedbStore::open(dir.path(), "second", false).unwrap();

        // Another process takes the same lock file.
        first.close().unwrap();
        assert!(matches!(
            FileLock::acquire(dir.path()),
            Err(Error::LocationInUse(_))
        ));

        second.close().unwrap();
        assert!(FileLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_delete_on_close_drops_only_its_table() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("db");
        let mut kept = RedbStore::open(&location, "kept", false).unwrap();
        let mut scratch = RedbStore::open(&location, "scratch", true).unwrap();
        kept.put(b"k", b"kept").unwrap();
        scratch.put(b"k", b"scratch").unwrap();

        scratch.close().unwrap();
        assert!(location.join(DB_FILE).exists());
        assert_eq!(kept.get(b"k").unwrap(), Some(b"kept".to_vec()));

        let mut reopened = RedbStore::open(&location, "scratch", true).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), None);

        kept.close().unwrap();
        assert!(location.exists());
        reopened.close().unwrap();
        assert!(!location.exists());
    }

    #[test]
    fn test_delete_on_close_and_closed_access() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("db");
        let mut store = RedbStore::open(&location, "entries", true).unwrap();
        store.put(b"k", b"v").unwrap();
        assert!(store.size_on_disk().unwrap() > 0);

        store.close().unwrap();
        assert!(!location.exists());
        assert!(store.get(b"k").is_err());
        store.close().unwrap();
    }
}
