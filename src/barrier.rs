//! Busy-wait barrier used between graph nodes.
//!
//! Barrier hold times inside an epoch are expected to be microseconds, so
//! arriving threads spin instead of parking. Sleeping is reserved for the idle
//! period between epochs (see [`crate::worker`]).

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A reusable spinning barrier over a variable number of participants.
///
/// The participant count is passed on every call rather than fixed at
/// construction, because each epoch may run on a different number of
/// threads. All participants of one barrier episode must pass the same count.
pub struct Barrier {
    /// Threads that have arrived at the current episode.
    arrived: CachePadded<AtomicUsize>,
    /// Completed episodes. Monotonic for the lifetime of the barrier.
    passed: CachePadded<AtomicUsize>,
}

impl Barrier {
    pub fn new() -> Self {
        Barrier {
            arrived: CachePadded::new(AtomicUsize::new(0)),
            passed: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks until `n_threads` threads have called `wait`.
    ///
    /// Returns `true` on exactly one thread per episode: the last one to arrive.
    pub fn wait(&self, n_threads: usize) -> bool {
        self.wait_then(n_threads, || {})
    }

    /// Like [`wait`](Self::wait), but the last thread to arrive runs
    /// `on_release` before any waiter is let through.
    ///
    /// Everything the closure writes is visible to every participant once
    /// they return. With a single participant the closure runs inline and no
    /// atomic is touched.
    pub fn wait_then<F: FnOnce()>(&self, n_threads: usize, on_release: F) -> bool {
        if n_threads <= 1 {
            on_release();
            return true;
        }

        // Read before entering: the counter cannot move again until we arrive.
        let n_passed = self.passed.load(Ordering::Relaxed);

        let n_arrived = self.arrived.fetch_add(1, Ordering::SeqCst);
        if n_arrived == n_threads - 1 {
            self.arrived.store(0, Ordering::Relaxed);
            on_release();
            self.passed.fetch_add(1, Ordering::SeqCst);
            return true;
        }

        while self.passed.load(Ordering::Relaxed) == n_passed {
            std::hint::spin_loop();
        }

        // Exit fence; an RMW rather than a standalone fence so sanitizers see it.
        self.passed.fetch_add(0, Ordering::SeqCst);
        false
    }

    /// Number of completed multi-thread episodes.
    pub fn passed(&self) -> usize {
        self.passed.load(Ordering::Relaxed)
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_single_thread_fast_path() {
        let barrier = Barrier::new();
        let mut ran = false;
        assert!(barrier.wait_then(1, || ran = true));
        assert!(ran);
        // Fast path never counts as an episode.
        assert_eq!(barrier.passed(), 0);
    }

    #[test]
    fn test_one_leader_per_episode() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;
        let barrier = Barrier::new();
        let leaders = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        if barrier.wait(THREADS) {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(leaders.load(Ordering::Relaxed), ROUNDS);
        assert_eq!(barrier.passed(), ROUNDS);
    }

    #[test]
    fn test_release_happens_after_every_entry() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 100;
        let barrier = Barrier::new();
        let clock = AtomicU64::new(0);
        let entries: Mutex<Vec<Vec<u64>>> = Mutex::new(vec![Vec::new(); ROUNDS]);
        let exits: Mutex<Vec<Vec<u64>>> = Mutex::new(vec![Vec::new(); ROUNDS]);
        let releases: Vec<AtomicU64> = (0..ROUNDS).map(|_| AtomicU64::new(0)).collect();

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for round in 0..ROUNDS {
                        let tick = clock.fetch_add(1, Ordering::SeqCst);
                        entries.lock().unwrap()[round].push(tick);
                        barrier.wait_then(THREADS, || {
                            let tick = clock.fetch_add(1, Ordering::SeqCst);
                            releases[round].store(tick, Ordering::Relaxed);
                        });
                        let tick = clock.fetch_add(1, Ordering::SeqCst);
                        exits.lock().unwrap()[round].push(tick);
                    }
                });
            }
        });

        let entries = entries.into_inner().unwrap();
        let exits = exits.into_inner().unwrap();
        for round in 0..ROUNDS {
            let release = releases[round].load(Ordering::Relaxed);
            assert_eq!(entries[round].len(), THREADS, "round {round} entries");
            assert!(
                entries[round].iter().all(|&t| t < release),
                "round {round}: release at {release} before entries {:?}",
                entries[round]
            );
            assert!(exits[round].iter().all(|&t| t > release));
        }
    }

    #[test]
    fn test_leader_writes_visible_to_all() {
        const THREADS: usize = 3;
        let barrier = Barrier::new();
        let cell = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for round in 1..=50 {
                        barrier.wait_then(THREADS, || cell.store(round, Ordering::Relaxed));
                        assert_eq!(cell.load(Ordering::Relaxed), round);
                        barrier.wait(THREADS);
                    }
                });
            }
        });
    }
}
