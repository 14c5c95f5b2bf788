//! The external map: a screen, a cache and a store behind one interface.
//!
//! Every key that was put and not removed lives in the cache or in the store,
//! never only in neither. The screen sees every key that was ever put, so a
//! "definitely absent" answer from it skips both tiers.

mod stats;

pub use stats::{format_bytes, Stats};

use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use self::stats::{Counters, Interval};
use crate::cache::{self, Cache};
use crate::config::{validate_map_id, MapConfig};
use crate::encoding::{Bincode, Converter};
use crate::error::{Failures, Result, Tier};
use crate::screen::{self, Screen};
use crate::store::{self, Store};

/// A key-value map that keeps hot entries in memory and spills the rest to a
/// store.
///
/// All operations take `&self` and run under one lock, so a map can be shared
/// between threads behind an `Arc`. Eviction and promotion happen inside the
/// calling operation; there is no background thread.
pub struct ExternalMap<K, V> {
    id: String,
    flush_on_close: bool,
    tiers: Mutex<Tiers<K, V>>,
}

struct Tiers<K, V> {
    screen: Box<dyn Screen<K>>,
    cache: Box<dyn Cache<K, V>>,
    store: Box<dyn Store>,
    keys: Box<dyn Converter<K>>,
    values: Box<dyn Converter<V>>,
    counters: Counters,
    interval: Option<Interval>,
}

impl<K, V> ExternalMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Builds every tier from `config`.
    pub fn open<KC, VC>(config: &MapConfig, keys: KC, values: VC) -> Result<Self>
    where
        KC: Converter<K> + 'static,
        VC: Converter<V> + 'static,
    {
        config.validate()?;
        let screen =
            screen::open(&config.screen).map_err(|e| e.context("failed to create screen"))?;
        let cache = cache::open(&config.cache).map_err(|e| e.context("failed to create cache"))?;
        let store = store::open(&config.store).map_err(|e| e.context("failed to create store"))?;

        let mut map = Self::from_parts(
            config.id.clone(),
            screen,
            cache,
            store,
            Box::new(keys),
            Box::new(values),
        )?
        .flush_on_close(config.flush_on_close);
        if let Some(interval) = config.reporting_interval {
            map = map.reporting_interval(interval);
        }

        tracing::debug!(
            map = %map.id,
            backend = ?config.store.backend,
            cache_size = config.cache.maximum_size,
            "Opened external map"
        );
        Ok(map)
    }

    /// Assembles a map from already constructed tiers.
    pub fn from_parts(
        id: impl Into<String>,
        screen: Box<dyn Screen<K>>,
        cache: Box<dyn Cache<K, V>>,
        store: Box<dyn Store>,
        keys: Box<dyn Converter<K>>,
        values: Box<dyn Converter<V>>,
    ) -> Result<Self> {
        let id = id.into();
        validate_map_id(&id)?;
        Ok(Self {
            id,
            flush_on_close: false,
            tiers: Mutex::new(Tiers {
                screen,
                cache,
                store,
                keys,
                values,
                counters: Counters::default(),
                interval: None,
            }),
        })
    }

    /// Logs statistics at most once per `interval`, checked on every operation.
    pub fn reporting_interval(mut self, interval: Duration) -> Self {
        self.tiers.get_mut().interval = Some(Interval::new(interval));
        self
    }

    /// Whether `close` drains the cache into the store first.
    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.flush_on_close = enabled;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Associates `value` with `key`, evicting least recently used entries
    /// into the store while the cache is over capacity.
    ///
    /// If an evicted entry cannot be written to the store it goes back to the
    /// eviction end of the cache and the error is returned, so nothing is lost.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        let mut tiers = self.tiers.lock();
        tiers.tick(&self.id);
        tiers.screen.add(&key);
        tiers.cache.put(key, value);
        tiers.drain()
    }

    /// Returns the value for `key`, promoting it into the cache if it came
    /// from the store.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut tiers = self.tiers.lock();
        tiers.tick(&self.id);
        tiers.get(key)
    }

    /// Checks presence without promoting.
    pub fn contains(&self, key: &K) -> Result<bool> {
        let mut tiers = self.tiers.lock();
        tiers.tick(&self.id);
        tiers.contains(key)
    }

    /// Removes `key` from every tier. Removing an absent key is not an error.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut tiers = self.tiers.lock();
        tiers.tick(&self.id);
        tiers.remove(key)
    }

    /// Empties the screen, the cache and the store together.
    pub fn clear(&self) -> Result<()> {
        let mut tiers = self.tiers.lock();
        tiers.log_stats(&self.id);

        let mut failures = Failures::default();
        let result = tiers.screen.clear();
        tiers.log_failure(&self.id, "Failed to clear screen", &result);
        failures.record(Tier::Screen, result);

        tiers.cache.clear();

        let result = tiers.store.clear();
        tiers.log_failure(&self.id, "Failed to clear store", &result);
        failures.record(Tier::Store, result);

        failures.into_result()
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        let mut tiers = self.tiers.lock();
        tiers.tick(&self.id);
        tiers.store.size_on_disk()
    }

    pub fn stats(&self) -> Stats {
        self.tiers.lock().stats()
    }

    /// Closes the map, flushing the cache if the map was built with
    /// `flush_on_close`.
    pub fn close(self) -> Result<()> {
        let flush = self.flush_on_close;
        self.close_with(flush)
    }

    /// Closes every tier, optionally draining the cache into the store first.
    ///
    /// Each step is attempted even if an earlier one failed. Failures are
    /// logged and returned together as `Error::Shutdown`.
    pub fn close_with(self, flush: bool) -> Result<()> {
        let id = self.id;
        let mut tiers = self.tiers.into_inner();
        let mut failures = Failures::default();

        tiers.log_stats(&id);
        if flush {
            let result = tiers.flush();
            tiers.log_failure(&id, "Failed to flush cache to store", &result);
            failures.record(Tier::Flush, result);
        }
        tiers.log_stats(&id);

        let result = tiers.screen.close();
        tiers.log_failure(&id, "Failed to close screen", &result);
        failures.record(Tier::Screen, result);

        let result = tiers.cache.close();
        tiers.log_failure(&id, "Failed to close cache", &result);
        failures.record(Tier::Cache, result);

        let result = tiers.store.close();
        tiers.log_failure(&id, "Failed to close store", &result);
        failures.record(Tier::Store, result);

        failures.into_result()
    }
}

impl<K, V> ExternalMap<K, V>
where
    K: Hash + Eq + Clone + Send + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Opens a map whose keys and values are stored with bincode.
    pub fn with_bincode(config: &MapConfig) -> Result<Self> {
        Self::open(config, Bincode, Bincode)
    }
}

impl<K, V> Tiers<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn get(&mut self, key: &K) -> Result<Option<V>> {
        if !self.screen.contains(key) {
            return Ok(None);
        }
        if let Some(value) = self.cache.get(key).cloned() {
            Counters::bump(&mut self.counters.cache_hits);
            return Ok(Some(value));
        }

        let encoded = self.keys.encode(key)?;
        match self.store.get(&encoded)? {
            Some(bytes) => {
                let value = self.values.decode(&bytes)?;
                Counters::bump(&mut self.counters.cache_misses);
                self.cache.put(key.clone(), value.clone());
                self.drain()?;
                Ok(Some(value))
            }
            None => {
                Counters::bump(&mut self.counters.false_positives);
                Ok(None)
            }
        }
    }

    fn contains(&mut self, key: &K) -> Result<bool> {
        if !self.screen.contains(key) {
            return Ok(false);
        }
        if self.cache.contains(key) {
            return Ok(true);
        }
        let encoded = self.keys.encode(key)?;
        self.store.contains(&encoded)
    }

    fn remove(&mut self, key: &K) -> Result<()> {
        if !self.screen.contains(key) {
            return Ok(());
        }
        self.screen.remove(key);
        self.cache.remove(key);
        let encoded = self.keys.encode(key)?;
        self.store.remove(&encoded)?;
        Ok(())
    }

    /// Evicts until the cache is back within its maximum size.
    fn drain(&mut self) -> Result<()> {
        while self.cache.has_exceeded_maximum_size() {
            if !self.evict_one()? {
                break;
            }
        }
        Ok(())
    }

    /// Writes every resident entry to the store.
    fn flush(&mut self) -> Result<()> {
        while self.cache.current_size() > 0 {
            if !self.evict_one()? {
                break;
            }
        }
        Ok(())
    }

    /// Moves the cache's victim into the store. Returns false if the cache
    /// was empty.
    fn evict_one(&mut self) -> Result<bool> {
        let (key, value) = match self.cache.evict() {
            Some(entry) => entry,
            None => return Ok(false),
        };
        match self.write_to_store(&key, &value) {
            Ok(()) => {
                Counters::bump(&mut self.counters.evictions);
                Ok(true)
            }
            Err(e) => {
                self.cache.restore(key, value);
                Err(e)
            }
        }
    }

    fn write_to_store(&mut self, key: &K, value: &V) -> Result<()> {
        let key = self.keys.encode(key)?;
        let value = self.values.encode(value)?;
        self.store.put(&key, &value)
    }
}

impl<K, V> Tiers<K, V> {
    fn stats(&self) -> Stats {
        Stats {
            evictions: self.counters.evictions,
            false_positives: self.counters.false_positives,
            cache_hits: self.counters.cache_hits,
            cache_misses: self.counters.cache_misses,
            screen_count: self.screen.size(),
            cache_count: self.cache.current_size(),
        }
    }

    fn tick(&mut self, id: &str) {
        let due = self.interval.as_mut().map_or(false, Interval::check);
        if due {
            self.log_stats(id);
        }
    }

    fn log_stats(&self, id: &str) {
        let size = match self.store.size_on_disk() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(map = %id, error = %e, "Failed to get size of external map store");
                None
            }
        };
        let stats = self.stats();
        tracing::info!(
            map = %id,
            evictions = %stats.evictions,
            false_positives = %stats.false_positives,
            cache_hits = %stats.cache_hits,
            cache_misses = %stats.cache_misses,
            screen_count = stats.screen_count,
            cache_count = stats.cache_count,
            store_size = %format_bytes(size),
            "External map stats"
        );
    }

    fn log_failure(&self, id: &str, message: &str, result: &Result<()>) {
        if let Err(e) = result {
            tracing::error!(map = %id, error = %e, "{}", message);
        }
    }
}
