//! Probabilistic membership screen in front of the cache and store.
//!
//! A screen answers "definitely absent" or "possibly present". It must never
//! report a key as absent after it was added, otherwise the map would hide
//! values that still live in the cache or store.

pub mod bloom;

pub use bloom::BloomFilter;

use crate::config::{ScreenConfig, ScreenSource};
use crate::error::Result;

use std::hash::Hash;
use std::marker::PhantomData;
use std::path::PathBuf;

pub trait Screen<K>: Send {
    /// Records the key.
    fn add(&mut self, key: &K);

    /// Returns false only if the key was never added.
    fn contains(&self, key: &K) -> bool;

    /// Best-effort removal. Returns whether the key was actually forgotten.
    fn remove(&mut self, key: &K) -> bool;

    /// Approximate number of adds.
    fn size(&self) -> u64;

    /// Resets to empty. Only safe when the cache and store are cleared too.
    fn clear(&mut self) -> Result<()>;

    /// Releases the screen, persisting it first if configured to.
    fn close(&mut self) -> Result<()>;
}

/// A screen backed by a bloom filter, optionally saved to a file on close.
#[derive(Debug)]
pub struct BloomScreen<K> {
    filter: BloomFilter,
    save_path: Option<PathBuf>,
    _key: PhantomData<fn(&K)>,
}

impl<K> BloomScreen<K> {
    pub fn new(filter: BloomFilter, save_path: Option<PathBuf>) -> Self {
        Self {
            filter,
            save_path,
            _key: PhantomData,
        }
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }
}

impl<K: Hash> Screen<K> for BloomScreen<K> {
    fn add(&mut self, key: &K) {
        self.filter.insert(key);
    }

    fn contains(&self, key: &K) -> bool {
        self.filter.contains(key)
    }

    /// Bits are shared between keys, so nothing can be removed.
    fn remove(&mut self, _key: &K) -> bool {
        false
    }

    fn size(&self) -> u64 {
        self.filter.count()
    }

    fn clear(&mut self) -> Result<()> {
        self.filter.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(path) = &self.save_path {
            self.filter.save(path)?;
            tracing::debug!(
                path = %path.display(),
                num_bits = self.filter.num_bits(),
                count = self.filter.count(),
                predicted_false_positive_probability = self.filter.current_false_positive_probability(),
                "Saved bloom screen"
            );
        }
        Ok(())
    }
}

/// Builds the screen described by `config`.
pub fn open<K: Hash + 'static>(config: &ScreenConfig) -> Result<Box<dyn Screen<K>>> {
    config.validate()?;
    let filter = match &config.source {
        ScreenSource::Create {
            expected_elements,
            false_positive_probability,
        } => BloomFilter::new(*expected_elements, *false_positive_probability),
        ScreenSource::Load(path) => BloomFilter::load(path)
            .map_err(|e| e.context(format!("failed to load bloom screen from {}", path.display())))?,
    };
    Ok(Box::new(BloomScreen::new(filter, config.save_path.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_is_a_no_op() {
        let mut screen: BloomScreen<String> = BloomScreen::new(BloomFilter::new(10, 0.01), None);
        let key = "artifact:/bin/ls".to_string();

        screen.add(&key);
        assert!(!screen.remove(&key));
        assert!(screen.contains(&key));
        assert_eq!(screen.size(), 1);
    }

    #[test]
    fn test_close_saves_and_open_restores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edges.bloom");

        let mut screen = open::<u64>(&ScreenConfig::create(1000, 0.01).save_path(&path)).unwrap();
        for i in 0..500u64 {
            screen.add(&i);
        }
        screen.close().unwrap();
        assert!(path.exists());

        // Sizing parameters are ignored when loading.
        let restored = open::<u64>(&ScreenConfig::load(&path)).unwrap();
        assert_eq!(restored.size(), 500);
        for i in 0..500u64 {
            assert!(restored.contains(&i));
        }
    }

    #[test]
    fn test_open_missing_snapshot_fails_with_context() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.bloom");
        let err = match open::<u64>(&ScreenConfig::load(&missing)) {
            Ok(_) => panic!("loading a missing snapshot should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("failed to load bloom screen"));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut screen = open::<&'static str>(&ScreenConfig::create(10, 0.01)).unwrap();
        screen.add(&"a");
        screen.clear().unwrap();
        assert!(!screen.contains(&"a"));
        assert_eq!(screen.size(), 0);
    }
}
