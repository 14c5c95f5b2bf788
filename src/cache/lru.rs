use std::{collections::HashMap, fmt::Debug, hash::Hash};

use super::Cache;

/// Slot index into the node slab.
type Link = Option<usize>;

struct Entry<K, V> {
    key: K,
    value: V,

    /// towards the most recently used end
    prev: Link,
    /// towards the least recently used end
    next: Link,
}

/// Least-recently-used cache.
///
/// Entries live in a slab and are threaded on a doubly linked recency list,
/// head = most recently used, tail = least recently used. The index maps each
/// key to its slot so every operation is O(1).
pub struct LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    maximum_size: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    /// vacated slots, reused before the slab grows
    free: Vec<usize>,
    head: Link,
    tail: Link,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(maximum_size: usize) -> Self {
        LruCache {
            maximum_size,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> LruIter<'_, K, V> {
        LruIter {
            cache: self,
            cursor: self.head,
        }
    }

    fn entry(&self, slot: usize) -> &Entry<K, V> {
        self.slots[slot]
            .as_ref()
            .expect("linked slot must be occupied")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<K, V> {
        self.slots[slot]
            .as_mut()
            .expect("linked slot must be occupied")
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.entry(slot);
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let entry = self.entry_mut(slot);
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn push_back(&mut self, slot: usize) {
        let old_tail = self.tail;
        {
            let entry = self.entry_mut(slot);
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(t) => self.entry_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn insert_slot(&mut self, key: K, value: V) -> usize {
        let entry = Entry {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        slot
    }

    fn touch(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn take(&mut self, slot: usize) -> Entry<K, V> {
        self.unlink(slot);
        self.free.push(slot);
        self.slots[slot]
            .take()
            .expect("linked slot must be occupied")
    }
}

impl<K, V> Cache<K, V> for LruCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Send,
{
    fn put(&mut self, key: K, value: V) {
        if let Some(&slot) = self.index.get(&key) {
            self.entry_mut(slot).value = value;
            self.touch(slot);
            return;
        }

        let slot = self.insert_slot(key, value);
        self.push_front(slot);
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(&self.entry(slot).value)
    }

    fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.take(slot);
                true
            }
            None => false,
        }
    }

    fn evict(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        let entry = self.take(slot);
        self.index.remove(&entry.key);
        Some((entry.key, entry.value))
    }

    fn restore(&mut self, key: K, value: V) {
        if let Some(&slot) = self.index.get(&key) {
            self.entry_mut(slot).value = value;
            return;
        }
        let slot = self.insert_slot(key, value);
        self.push_back(slot);
    }

    fn current_size(&self) -> usize {
        self.index.len()
    }

    fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }
}

impl<K, V> Debug for LruCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("maximum_size", &self.maximum_size)
            .field("current_size", &self.index.len())
            .finish()
    }
}

pub struct LruIter<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    cache: &'a LruCache<K, V>,
    cursor: Link,
}

impl<'a, K, V> Iterator for LruIter<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let entry = self.cache.entry(slot);
        self.cursor = entry.next;
        Some((&entry.key, &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use super::*;

    fn assert_opt_eq<V: PartialEq + Debug>(opt: Option<&V>, v: V) {
        assert!(opt.is_some());
        assert_eq!(opt.unwrap(), &v);
    }

    fn keys<K: Eq + Hash + Clone + Copy, V>(cache: &LruCache<K, V>) -> Vec<K> {
        cache.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_push_and_read() {
        let mut cache = LruCache::new(2);

        cache.put("apple", "red");
        cache.put("banana", "yellow");

        assert_opt_eq(cache.get(&"apple"), "red");
        assert_opt_eq(cache.get(&"banana"), "yellow");
        assert!(!cache.has_exceeded_maximum_size());
    }

    #[test]
    fn test_evict_takes_least_recently_used() {
        let mut cache = LruCache::new(2);

        cache.put("apple", "red");
        cache.put("banana", "yellow");
        cache.get(&"apple");
        cache.put("pear", "green");

        assert!(cache.has_exceeded_maximum_size());
        assert_eq!(cache.evict(), Some(("banana", "yellow")));
        assert!(!cache.has_exceeded_maximum_size());
        assert_eq!(keys(&cache), vec!["pear", "apple"]);
    }

    #[test]
    fn test_put_updates_value_and_recency() {
        let mut cache = LruCache::new(3);
        cache.put(1, "one");
        cache.put(2, "two");
        cache.put(1, "uno");

        assert_eq!(cache.current_size(), 2);
        assert_eq!(keys(&cache), vec![1, 2]);
        assert_eq!(cache.evict(), Some((2, "two")));
        assert_eq!(cache.evict(), Some((1, "uno")));
        assert_eq!(cache.evict(), None);
    }

    #[test]
    fn test_contains_does_not_touch() {
        let mut cache = LruCache::new(2);
        cache.put(1, 1);
        cache.put(2, 2);

        assert!(cache.contains(&1));
        assert_eq!(cache.evict(), Some((1, 1)));
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let mut cache = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i * 10);
        }

        assert!(cache.remove(&2));
        assert!(!cache.remove(&2));
        assert_eq!(cache.current_size(), 3);

        cache.put(9, 90);
        assert_eq!(cache.slots.len(), 4);
        assert_eq!(keys(&cache), vec![9, 3, 1, 0]);
    }

    #[test]
    fn test_restore_goes_to_the_lru_end() {
        let mut cache = LruCache::new(3);
        cache.put(1, "one");
        cache.put(2, "two");
        cache.put(3, "three");

        let victim = cache.evict().unwrap();
        assert_eq!(victim, (1, "one"));
        cache.restore(victim.0, victim.1);
        assert_eq!(keys(&cache), vec![3, 2, 1]);

        // A resident key keeps its place.
        cache.restore(3, "drei");
        assert_eq!(keys(&cache), vec![3, 2, 1]);
        assert_eq!(cache.get(&3), Some(&"drei"));

        cache.clear();
        cache.restore(9, "nine");
        assert_eq!(keys(&cache), vec![9]);
        assert_eq!(cache.evict(), Some((9, "nine")));
    }

    #[test]
    fn test_zero_maximum_size() {
        let mut cache = LruCache::new(0);
        cache.put("k", "v");

        assert_eq!(cache.maximum_size(), 0);
        assert!(cache.has_exceeded_maximum_size());
        assert_eq!(cache.evict(), Some(("k", "v")));
        assert!(!cache.has_exceeded_maximum_size());
    }

    #[test]
    fn test_clear() {
        let mut cache = LruCache::new(2);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.clear();

        assert_eq!(cache.current_size(), 0);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.evict(), None);
    }

    #[test]
    fn test_no_memory_leaks() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug, Clone)]
        struct DropCounter;

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, SeqCst);
            }
        }

        let n = 100;
        for _ in 0..n {
            let mut cache = LruCache::new(20);
            for i in 0..n {
                cache.put(i, DropCounter {});
                while cache.has_exceeded_maximum_size() {
                    cache.evict();
                }
            }
        }
        assert_eq!(DROP_COUNT.load(SeqCst), n * n);
    }
}
