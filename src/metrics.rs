use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Pool counters.
///
/// All updates are relaxed. Hot loops accumulate locally and publish once
/// per wait or per node, so the counters never sit on a contended line
/// during polling.
#[derive(Debug)]
pub struct Metrics {
    /// Epochs kicked off.
    pub epochs: AtomicU64,
    /// Relax rounds spent busy-polling for new work.
    pub poll_rounds: AtomicU64,
    /// Times a worker blocked on the pool's condition variable.
    pub sleeps: AtomicU64,
    /// Chunks claimed through the shared cursor (beyond each thread's first).
    pub dynamic_claims: AtomicU64,
    /// Epochs stopped by the abort predicate.
    pub aborts: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            epochs: AtomicU64::new(0),
            poll_rounds: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            dynamic_claims: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of current values; barrier passes come from the pool's barrier.
    pub fn snapshot(&self, barrier_passes: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            epochs: self.epochs.load(Ordering::Relaxed),
            poll_rounds: self.poll_rounds.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            dynamic_claims: self.dynamic_claims.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            barrier_passes: barrier_passes as u64,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub epochs: u64,
    pub poll_rounds: u64,
    pub sleeps: u64,
    pub dynamic_claims: u64,
    pub aborts: u64,
    pub barrier_passes: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    pub fn epochs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.epochs as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}
