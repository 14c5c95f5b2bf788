use crossbeam_skiplist::SkipMap;

use super::Store;
use crate::error::Result;

/// Volatile store kept entirely in a skip list. Nothing reaches disk.
#[derive(Default)]
pub struct MemoryStore {
    entries: SkipMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemoryStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn size_on_disk(&self) -> Result<u64> {
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let mut store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"a", b"2").unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_remove_reports_presence() {
        let mut store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();

        assert!(store.remove(b"a").unwrap());
        assert!(!store.remove(b"a").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_and_size() {
        let mut store = MemoryStore::new();
        for i in 0u8..10 {
            store.put(&[i], &[i; 100]).unwrap();
        }
        assert_eq!(store.size_on_disk().unwrap(), 0);

        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
