use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on the element count a bloom screen may be sized for.
pub const MAX_EXPECTED_ELEMENTS: u64 = i32::MAX as u64;

/// Configuration for an external map and its three tiers.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Map id used in log output. Must be non-empty, without spaces or dots.
    pub id: String,

    pub screen: ScreenConfig,

    pub cache: CacheConfig,

    pub store: StoreConfig,

    /// How often statistics are logged (default: never)
    pub reporting_interval: Option<Duration>,

    /// Drain the cache into the store on close (default: false)
    pub flush_on_close: bool,
}

impl MapConfig {
    /// Create a new config with the given id and store
    pub fn new(id: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            id: id.into(),
            screen: ScreenConfig::default(),
            cache: CacheConfig::default(),
            store,
            reporting_interval: None,
            flush_on_close: false,
        }
    }

    pub fn screen(mut self, screen: ScreenConfig) -> Self {
        self.screen = screen;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = Some(interval);
        self
    }

    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.flush_on_close = enabled;
        self
    }

    /// Checks every parameter, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_map_id(&self.id)?;
        if self.reporting_interval == Some(Duration::ZERO) {
            return Err(Error::Config(
                "map reporting interval must be non-zero".to_string(),
            ));
        }
        self.screen
            .validate()
            .map_err(|e| e.context("invalid screen config"))?;
        self.store
            .validate()
            .map_err(|e| e.context("invalid store config"))?;
        Ok(())
    }
}

pub fn validate_map_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Config("empty external map id".to_string()));
    }
    if id.contains(' ') || id.contains('.') {
        return Err(Error::Config(format!(
            "external map id must not contain spaces or dots: '{}'",
            id
        )));
    }
    Ok(())
}

/// Where the bloom screen's initial state comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenSource {
    /// A fresh, empty filter sized for the given load.
    Create {
        expected_elements: u64,
        false_positive_probability: f64,
    },
    /// A snapshot previously written at close. Sizing comes from the file.
    Load(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenConfig {
    pub source: ScreenSource,

    /// Snapshot destination written on close (default: none)
    pub save_path: Option<PathBuf>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            source: ScreenSource::Create {
                expected_elements: 1_000_000,
                false_positive_probability: 0.01,
            },
            save_path: None,
        }
    }
}

impl ScreenConfig {
    pub fn create(expected_elements: u64, false_positive_probability: f64) -> Self {
        Self {
            source: ScreenSource::Create {
                expected_elements,
                false_positive_probability,
            },
            save_path: None,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ScreenSource::Load(path.into()),
            save_path: None,
        }
    }

    pub fn save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.source {
            ScreenSource::Create {
                expected_elements,
                false_positive_probability,
            } => {
                if *expected_elements == 0 || *expected_elements > MAX_EXPECTED_ELEMENTS {
                    return Err(Error::Config(format!(
                        "expected elements must be in [1, {}], got {}",
                        MAX_EXPECTED_ELEMENTS, expected_elements
                    )));
                }
                let p = *false_positive_probability;
                if !(p > 0.0 && p < 1.0) {
                    return Err(Error::Config(format!(
                        "false positive probability must be in (0, 1), got {}",
                        p
                    )));
                }
            }
            ScreenSource::Load(path) => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config("empty screen load path".to_string()));
                }
            }
        }
        if let Some(path) = &self.save_path {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("empty screen save path".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Lru,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of resident entries before eviction (default: 10,000). Zero
    /// means nothing stays resident past the call that inserted it.
    pub maximum_size: usize,

    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_size: 10_000,
            policy: CachePolicy::Lru,
        }
    }
}

impl CacheConfig {
    pub fn maximum_size(mut self, size: usize) -> Self {
        self.maximum_size = size;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Volatile skip list, nothing reaches disk.
    Memory,
    /// Append-only record log with an in-memory index.
    Log,
    /// Embedded B-tree database.
    Redb,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Directory owned by the store. Ignored by the memory backend.
    pub dir: PathBuf,

    /// Table holding the entries inside a redb database (default: "entries")
    pub table: String,

    /// Remove the directory after close (default: false)
    pub delete_on_close: bool,

    /// Log per-operation call counts and latency at this interval (default: never)
    pub reporting_interval: Option<Duration>,
}

impl StoreConfig {
    fn with_backend(backend: StoreBackend, dir: PathBuf) -> Self {
        Self {
            backend,
            dir,
            table: "entries".to_string(),
            delete_on_close: false,
            reporting_interval: None,
        }
    }

    pub fn memory() -> Self {
        Self::with_backend(StoreBackend::Memory, PathBuf::new())
    }

    pub fn log(dir: impl Into<PathBuf>) -> Self {
        Self::with_backend(StoreBackend::Log, dir.into())
    }

    pub fn redb(dir: impl Into<PathBuf>) -> Self {
        Self::with_backend(StoreBackend::Redb, dir.into())
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn delete_on_close(mut self, enabled: bool) -> Self {
        self.delete_on_close = enabled;
        self
    }

    pub fn reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend != StoreBackend::Memory && self.dir.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "{:?} store needs a directory",
                self.backend
            )));
        }
        if self.backend == StoreBackend::Redb && self.table.trim().is_empty() {
            return Err(Error::Config("empty redb table name".to_string()));
        }
        if self.reporting_interval == Some(Duration::ZERO) {
            return Err(Error::Config(
                "store reporting interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MapConfig::new("artifacts", StoreConfig::memory());
        assert_eq!(config.cache.maximum_size, 10_000);
        assert_eq!(config.cache.policy, CachePolicy::Lru);
        assert_eq!(
            config.screen.source,
            ScreenSource::Create {
                expected_elements: 1_000_000,
                false_positive_probability: 0.01
            }
        );
        assert!(config.screen.save_path.is_none());
        assert!(config.reporting_interval.is_none());
        assert!(!config.flush_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MapConfig::new("processes", StoreConfig::log("/tmp/processes"))
            .screen(ScreenConfig::create(500, 0.001).save_path("/tmp/processes.bloom"))
            .cache(CacheConfig::default().maximum_size(64))
            .reporting_interval(Duration::from_secs(30))
            .flush_on_close(true);

        assert_eq!(config.cache.maximum_size, 64);
        assert_eq!(
            config.screen.save_path,
            Some(PathBuf::from("/tmp/processes.bloom"))
        );
        assert_eq!(config.store.backend, StoreBackend::Log);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/processes"));
        assert_eq!(config.reporting_interval, Some(Duration::from_secs(30)));
        assert!(config.flush_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_map_id_rules() {
        assert!(validate_map_id("edges").is_ok());
        assert!(validate_map_id("").is_err());
        assert!(validate_map_id("   ").is_err());
        assert!(validate_map_id("two words").is_err());
        assert!(validate_map_id("dotted.id").is_err());
    }

    #[test]
    fn test_screen_bounds() {
        assert!(ScreenConfig::create(0, 0.1).validate().is_err());
        assert!(ScreenConfig::create(MAX_EXPECTED_ELEMENTS + 1, 0.1)
            .validate()
            .is_err());
        assert!(ScreenConfig::create(10, 0.0).validate().is_err());
        assert!(ScreenConfig::create(10, 1.0).validate().is_err());
        assert!(ScreenConfig::create(10, f64::NAN).validate().is_err());
        assert!(ScreenConfig::create(10, 0.5).validate().is_ok());
        assert!(ScreenConfig::load("").validate().is_err());
        assert!(ScreenConfig::load("/tmp/a.bloom").validate().is_ok());
    }

    #[test]
    fn test_store_validation() {
        assert!(StoreConfig::memory().validate().is_ok());
        assert!(StoreConfig::log("").validate().is_err());
        assert!(StoreConfig::redb("/tmp/db").table(" ").validate().is_err());
        assert!(StoreConfig::redb("/tmp/db")
            .reporting_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validation_error_names_the_tier() {
        let config = MapConfig::new("artifacts", StoreConfig::log(""));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with("invalid store config"));
    }
}
