use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Store;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Put,
    Get,
    Remove,
    Contains,
    Clear,
    SizeOnDisk,
}

impl StoreOp {
    const ALL: [StoreOp; 6] = [
        StoreOp::Put,
        StoreOp::Get,
        StoreOp::Remove,
        StoreOp::Contains,
        StoreOp::Clear,
        StoreOp::SizeOnDisk,
    ];
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::Put => "put",
            StoreOp::Get => "get",
            StoreOp::Remove => "remove",
            StoreOp::Contains => "contains",
            StoreOp::Clear => "clear",
            StoreOp::SizeOnDisk => "size_on_disk",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct OpCounter {
    calls: AtomicU64,
    nanos: AtomicU64,
}

/// Wraps a store and records call counts and cumulative latency per
/// operation, logging them every `interval`.
pub struct ProfiledStore<S> {
    inner: S,
    interval: Duration,
    last_report: Mutex<Instant>,
    counters: [OpCounter; 6],
}

impl<S: Store> ProfiledStore<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_report: Mutex::new(Instant::now()),
            counters: Default::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn calls(&self, op: StoreOp) -> u64 {
        self.counters[op as usize].calls.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self, op: StoreOp) -> Duration {
        Duration::from_nanos(self.counters[op as usize].nanos.load(Ordering::Relaxed))
    }

    fn record(&self, op: StoreOp, started: Instant) {
        let counter = &self.counters[op as usize];
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        counter.calls.fetch_add(1, Ordering::Relaxed);
        counter.nanos.fetch_add(nanos, Ordering::Relaxed);

        let mut last = self.last_report.lock();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            drop(last);
            self.report();
        }
    }

    fn report(&self) {
        for op in StoreOp::ALL {
            let calls = self.calls(op);
            if calls == 0 {
                continue;
            }
            let total = self.elapsed(op);
            tracing::info!(
                op = %op,
                calls,
                total_ms = total.as_millis() as u64,
                mean_us = (total.as_micros() / calls as u128) as u64,
                "Store profile"
            );
        }
    }
}

impl<S: Store> Store for ProfiledStore<S> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.put(key, value);
        self.record(StoreOp::Put, started);
        result
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let result = self.inner.get(key);
        self.record(StoreOp::Get, started);
        result
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let started = Instant::now();
        let result = self.inner.remove(key);
        self.record(StoreOp::Remove, started);
        result
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        let started = Instant::now();
        let result = self.inner.contains(key);
        self.record(StoreOp::Contains, started);
        result
    }

    fn clear(&mut self) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.clear();
        self.record(StoreOp::Clear, started);
        result
    }

    fn size_on_disk(&self) -> Result<u64> {
        let started = Instant::now();
        let result = self.inner.size_on_disk();
        self.record(StoreOp::SizeOnDisk, started);
        result
    }

    fn close(&mut self) -> Result<()> {
        self.report();
        self.inner.close()
    }
}
