//! Bounded in-memory tier.
//!
//! The cache never evicts on its own. It reports when it holds more than
//! `maximum_size` entries and hands out exactly one victim per `evict` call;
//! the map decides when to call it and where the victim goes.

pub mod lru;

pub use lru::LruCache;

use crate::config::{CacheConfig, CachePolicy};
use crate::error::Result;

use std::hash::Hash;

pub trait Cache<K, V>: Send {
    /// Inserts or replaces the value and marks the key most recently used.
    fn put(&mut self, key: K, value: V);

    /// Returns the value and marks the key most recently used.
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Checks residency without touching recency.
    fn contains(&self, key: &K) -> bool;

    fn remove(&mut self, key: &K) -> bool;

    /// Removes and returns the entry chosen by the eviction policy.
    fn evict(&mut self) -> Option<(K, V)>;

    /// Puts back an entry returned by `evict` so that it is the next victim
    /// again. A key that is already resident keeps its position.
    fn restore(&mut self, key: K, value: V);

    fn current_size(&self) -> usize;

    fn maximum_size(&self) -> usize;

    fn has_exceeded_maximum_size(&self) -> bool {
        self.current_size() > self.maximum_size()
    }

    fn clear(&mut self);

    /// Drops every resident entry. Entries that were not flushed are lost.
    fn close(&mut self) -> Result<()> {
        self.clear();
        Ok(())
    }
}

/// Builds the cache described by `config`.
pub fn open<K, V>(config: &CacheConfig) -> Result<Box<dyn Cache<K, V>>>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    match config.policy {
        CachePolicy::Lru => Ok(Box::new(LruCache::new(config.maximum_size))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_lru() {
        let mut cache = open::<u32, String>(&CacheConfig::default().maximum_size(1)).unwrap();
        assert_eq!(cache.maximum_size(), 1);

        cache.put(1, "a".to_string());
        cache.put(2, "b".to_string());
        assert!(cache.has_exceeded_maximum_size());
        assert_eq!(cache.evict(), Some((1, "a".to_string())));

        cache.restore(1, "a".to_string());
        assert_eq!(cache.evict(), Some((1, "a".to_string())));

        cache.close().unwrap();
        assert_eq!(cache.current_size(), 0);
    }
}
