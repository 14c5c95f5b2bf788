//! A key-value map for more entries than fit in memory.
//!
//! An [`ExternalMap`] puts three tiers behind one interface: a bloom filter
//! screen that rejects absent keys without I/O, a bounded LRU cache holding
//! the hot entries, and a durable store that receives whatever the cache
//! evicts.

pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod map;
pub mod screen;
pub mod store;

pub use cache::{Cache, LruCache};
pub use config::{
    CacheConfig, CachePolicy, MapConfig, ScreenConfig, ScreenSource, StoreBackend, StoreConfig,
};
pub use encoding::{Bincode, Converter, Raw, Utf8};
pub use error::{Error, Result, Tier, TierError};
pub use map::{ExternalMap, Stats};
pub use screen::{BloomFilter, BloomScreen, Screen};
pub use store::{LogStore, MemoryStore, ProfiledStore, RedbStore, Store};
