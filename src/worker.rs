//! Worker thread implementation.
//!
//! A worker alternates between two phases. While idle it waits for the
//! pool's generation counter to move: first by busy-polling for a budget set
//! by the poll level, then by sleeping on the pool's condition variable.
//! Once it sees a new epoch that includes it, it walks the graph node by
//! node, computing its share and meeting the other active threads at the
//! barrier after each node.

use crate::error::Status;
use crate::metrics::Metrics;
use crate::params::ComputeParams;
use crate::pool::Shared;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Instant;
use tracing::{error, trace, warn};

/// Relax rounds per poll level.
pub const POLL_ROUNDS_PER_LEVEL: u64 = 128 * 1024;

/// Highest accepted poll level.
pub const MAX_POLL_LEVEL: u32 = 100;

/// Private state of one secondary worker thread.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) ith: usize,
    /// Generation this worker last acted on.
    last_generation: usize,
    /// A new epoch that includes this worker has been seen but not run yet.
    pending: bool,
}

impl WorkerState {
    pub(crate) fn new(ith: usize) -> Self {
        WorkerState {
            ith,
            last_generation: 0,
            pending: false,
        }
    }
}

/// Applies the pool's priority and this worker's CPU mask to the calling thread.
pub(crate) fn apply_placement(shared: &Shared, ith: usize) {
    if let Err(err) = shared.platform.apply_priority(shared.priority) {
        warn!(ith, priority = ?shared.priority, %err, "failed to set thread priority");
    }
    let mask = &shared.masks[ith];
    if !mask.is_empty() {
        if let Err(err) = shared.platform.apply_affinity(mask) {
            warn!(ith, ?mask, %err, "failed to set thread affinity");
        }
    }
}

/// Main loop of workers `1..N`.
pub(crate) fn secondary_main(shared: Arc<Shared>, mut state: WorkerState) {
    apply_placement(&shared, state.ith);

    loop {
        while shared.pause.load(Ordering::SeqCst) {
            let guard = shared.lock();
            if shared.pause.load(Ordering::SeqCst) && !shared.stop.load(Ordering::SeqCst) {
                Metrics::add(&shared.metrics.sleeps, 1);
                drop(shared.wait(guard));
            }
        }

        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        if check_for_work(&shared, &mut state) {
            state.pending = false;
            compute_thread(&shared, state.ith);
        }
    }

    trace!(ith = state.ith, "worker exiting");
}

/// True when the worker has something to react to: a pending epoch, a stop,
/// or a pause.
fn ready(shared: &Shared, state: &mut WorkerState) -> bool {
    if state.pending || shared.stop.load(Ordering::Relaxed) || shared.pause.load(Ordering::Relaxed) {
        return true;
    }

    let generation = shared.generation.load(Ordering::Relaxed);
    if generation != state.last_generation {
        // Pairs with the SeqCst bump in kickoff: the active count and epoch
        // pointer written before it are visible from here on.
        fence(Ordering::Acquire);
        state.pending = state.ith < shared.n_threads_cur.load(Ordering::Relaxed);
        state.last_generation = generation;
    }
    state.pending
}

/// Busy-polls for up to `poll_level * POLL_ROUNDS_PER_LEVEL` rounds.
fn poll_for_work(shared: &Shared, state: &mut WorkerState) -> bool {
    // Threads left out of the last epoch go straight to sleep.
    if state.ith >= shared.n_threads_cur.load(Ordering::Relaxed) {
        return state.pending;
    }

    let rounds = POLL_ROUNDS_PER_LEVEL * u64::from(shared.poll_level);
    let mut i = 0;
    while i < rounds && !ready(shared, state) {
        std::hint::spin_loop();
        i += 1;
    }
    Metrics::add(&shared.metrics.poll_rounds, i);
    state.pending
}

/// Waits until there is something to do. Returns whether an epoch is pending.
fn check_for_work(shared: &Shared, state: &mut WorkerState) -> bool {
    if poll_for_work(shared, state) {
        return state.pending;
    }

    let mut guard = shared.lock();
    while !ready(shared, state) {
        Metrics::add(&shared.metrics.sleeps, 1);
        guard = shared.wait(guard);
    }
    drop(guard);
    state.pending
}

/// Aborts the process if a kernel unwinds mid-epoch: the other threads would
/// otherwise spin at the next barrier forever, or read a graph that no
/// longer exists.
struct AbortOnUnwind {
    ith: usize,
}

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(ith = self.ith, "operation panicked during an epoch, aborting");
            std::process::abort();
        }
    }
}

/// Runs the current epoch on thread `ith`.
///
/// Must only be called after this thread has observed the epoch's generation
/// (worker 0 is the thread that published it). Nothing from the epoch is
/// touched after the final barrier.
pub(crate) fn compute_thread(shared: &Shared, ith: usize) {
    let _unwind = AbortOnUnwind { ith };

    // Valid until the final barrier below.
    let epoch = unsafe { shared.current_epoch() };
    let nth = shared.n_threads_cur.load(Ordering::Relaxed);

    if let Some(mask) = shared.topology.numa_mask(&shared.numa, ith) {
        if let Err(err) = shared.platform.apply_affinity(&mask) {
            warn!(ith, %err, "failed to apply numa placement");
        }
    }

    let nodes = epoch.graph.nodes();
    let n_tasks = epoch.plan.n_tasks();
    let numa = shared.topology.is_numa();
    let mut trace = shared
        .profiler
        .as_ref()
        .map(|profiler| profiler.local(ith, epoch.generation));
    let mut dynamic_claims = 0;

    for (node_n, node) in nodes.iter().enumerate() {
        if shared.abort.load(Ordering::Relaxed) <= node_n {
            break;
        }
        if node.is_noop() {
            continue;
        }

        let node_tasks = n_tasks[node_n].min(nth);
        if ith < node_tasks {
            let start = trace.as_ref().map(|_| Instant::now());
            // Each thread only touches its own slice of the scratch buffer.
            let mut params = unsafe {
                ComputeParams::new(
                    ith,
                    node_tasks,
                    epoch.scratch,
                    epoch.scratch_len,
                    &shared.current_chunk,
                    &shared.chunking,
                    numa,
                )
            };
            node.compute(&mut params);
            dynamic_claims += params.dynamic_claims;

            if let (Some(trace), Some(start)) = (trace.as_mut(), start) {
                trace.record(&node.name, node_n, start, start.elapsed());
            }
        }

        if ith == 0 && epoch.plan.should_abort() {
            shared.abort.store(node_n + 1, Ordering::Relaxed);
            shared.status.store(Status::Aborted as u8, Ordering::Relaxed);
        }

        if node_n + 1 < nodes.len() {
            shared.node_barrier(nth);
        }
    }

    Metrics::add(&shared.metrics.dynamic_claims, dynamic_claims as u64);
    drop(trace);

    shared.node_barrier(nth);
}
