use std::fmt;
use std::time::{Duration, Instant};

/// Point-in-time view of a map's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Entries written from the cache to the store.
    pub evictions: u128,
    /// Lookups the screen let through that neither tier could answer.
    pub false_positives: u128,
    pub cache_hits: u128,
    /// Lookups answered by the store, each followed by a promotion.
    pub cache_misses: u128,
    /// Adds recorded by the screen.
    pub screen_count: u64,
    /// Entries resident in the cache.
    pub cache_count: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "evictions={}, falsePositives={}, cacheHits={}, cacheMisses={}, screenCount={}, cacheCount={}",
            self.evictions,
            self.false_positives,
            self.cache_hits,
            self.cache_misses,
            self.screen_count,
            self.cache_count
        )
    }
}

/// Running counters owned by one map. Saturate instead of wrapping.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) evictions: u128,
    pub(crate) false_positives: u128,
    pub(crate) cache_hits: u128,
    pub(crate) cache_misses: u128,
}

impl Counters {
    pub(crate) fn bump(counter: &mut u128) {
        *counter = counter.saturating_add(1);
    }
}

/// Fires at most once per `every`, checked by the caller.
#[derive(Debug)]
pub(crate) struct Interval {
    every: Duration,
    last: Instant,
}

impl Interval {
    pub(crate) fn new(every: Duration) -> Self {
        Self {
            every,
            last: Instant::now(),
        }
    }

    pub(crate) fn check(&mut self) -> bool {
        if self.last.elapsed() >= self.every {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Renders a byte count with a binary unit, e.g. `1.50 KiB`.
pub fn format_bytes(bytes: Option<u64>) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    let bytes = match bytes {
        Some(bytes) => bytes,
        None => return "unknown".to_string(),
    };
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(None), "unknown");
        assert_eq!(format_bytes(Some(0)), "0 B");
        assert_eq!(format_bytes(Some(1023)), "1023 B");
        assert_eq!(format_bytes(Some(1536)), "1.50 KiB");
        assert_eq!(format_bytes(Some(5 * 1024 * 1024)), "5.00 MiB");
        assert_eq!(format_bytes(Some(3 << 40)), "3.00 TiB");
    }

    #[test]
    fn test_counters_saturate() {
        let mut counter = u128::MAX;
        Counters::bump(&mut counter);
        assert_eq!(counter, u128::MAX);
    }

    #[test]
    fn test_interval() {
        let mut interval = Interval::new(Duration::from_secs(3600));
        assert!(!interval.check());

        let mut interval = Interval::new(Duration::ZERO);
        assert!(interval.check());
    }

    #[test]
    fn test_display() {
        let stats = Stats {
            evictions: 3,
            cache_hits: 2,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "evictions=3, falsePositives=0, cacheHits=2, cacheMisses=0, screenCount=0, cacheCount=0"
        );
    }
}
