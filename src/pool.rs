//! Thread pool lifecycle and epoch execution.
//!
//! A [`ThreadPool`] owns `n_threads - 1` secondary worker threads; the caller
//! of [`ThreadPool::compute`] acts as worker 0. Each compute call is one
//! *epoch*: the caller publishes the graph and plan, bumps the generation
//! counter, runs its own share, and returns once every active thread has
//! passed the final barrier.

use crate::affinity::{CpuMask, PlatformOps, Priority, default_platform, next_cpumask};
use crate::barrier::Barrier;
use crate::chunk::ChunkConfig;
use crate::error::{PoolError, Status};
use crate::graph::Graph;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::plan::{Plan, default_threads};
use crate::profile::Profiler;
use crate::topology::{NumaStrategy, Topology};
use crate::worker::{self, MAX_POLL_LEVEL, WorkerState};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// No abort requested for the running epoch.
pub(crate) const NO_ABORT: usize = usize::MAX;

/// Pool construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Total worker count including the calling thread. 0 means one per CPU.
    pub n_threads: usize,
    pub priority: Priority,
    /// Busy-poll budget before sleeping, 0..=100. Default: 50.
    pub poll_level: u32,
    /// CPUs workers may run on. Empty leaves affinity untouched.
    pub cpumask: CpuMask,
    /// Pin each worker to its own CPU from `cpumask` instead of the whole mask.
    pub strict_cpu: bool,
    /// Create the pool paused. The first compute resumes it.
    pub paused: bool,
    pub numa: NumaStrategy,
    pub chunking: ChunkConfig,
    /// Record per-node spans into a [`Profiler`].
    pub profile: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_threads: 0,
            priority: Priority::Normal,
            poll_level: 50,
            cpumask: CpuMask::empty(),
            strict_cpu: false,
            paused: false,
            numa: NumaStrategy::Disabled,
            chunking: ChunkConfig::default(),
            profile: false,
        }
    }
}

impl PoolConfig {
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_poll_level(mut self, poll_level: u32) -> Self {
        self.poll_level = poll_level;
        self
    }

    pub fn with_cpumask(mut self, cpumask: CpuMask, strict: bool) -> Self {
        self.cpumask = cpumask;
        self.strict_cpu = strict;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn with_numa(mut self, numa: NumaStrategy) -> Self {
        self.numa = numa;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_profiling(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    Running,
    Paused,
    Stopped,
}

/// What worker 0 publishes for one epoch. Lives on the caller's stack for
/// the duration of [`ThreadPool::compute`].
pub(crate) struct Epoch<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) plan: &'a Plan,
    pub(crate) scratch: *mut u8,
    pub(crate) scratch_len: usize,
    pub(crate) generation: u64,
}

/// State shared by every worker of a pool.
pub(crate) struct Shared {
    pub(crate) generation: CachePadded<AtomicUsize>,
    pub(crate) n_threads_cur: CachePadded<AtomicUsize>,
    pub(crate) barrier: Barrier,
    /// Relative chunk cursor of the node being executed.
    pub(crate) current_chunk: CachePadded<AtomicUsize>,
    /// First node index that must not run.
    pub(crate) abort: CachePadded<AtomicUsize>,
    pub(crate) status: AtomicU8,
    pub(crate) epoch: AtomicPtr<()>,

    pub(crate) stop: AtomicBool,
    pub(crate) pause: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,

    pub(crate) n_threads_max: usize,
    pub(crate) poll_level: u32,
    pub(crate) priority: Priority,
    pub(crate) numa: NumaStrategy,
    pub(crate) chunking: ChunkConfig,
    /// Placement mask per worker index.
    pub(crate) masks: Vec<CpuMask>,
    pub(crate) topology: Topology,
    pub(crate) platform: Arc<dyn PlatformOps>,
    pub(crate) metrics: Metrics,
    pub(crate) profiler: Option<Profiler>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Barrier between nodes. The last thread in rewinds the chunk cursor
    /// before anyone moves on to the next node.
    pub(crate) fn node_barrier(&self, n_threads: usize) {
        self.barrier.wait_then(n_threads, || {
            self.current_chunk.store(0, Ordering::Relaxed);
        });
    }

    /// # Safety
    ///
    /// Only valid while an epoch is running and the caller is one of its
    /// active threads.
    pub(crate) unsafe fn current_epoch(&self) -> &Epoch<'_> {
        unsafe { &*(self.epoch.load(Ordering::Acquire) as *const Epoch<'_>) }
    }

    fn resume_locked(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// A persistent pool of compute threads.
///
/// # Example
///
/// ```
/// use graphexec::{Graph, Plan, PoolConfig, ThreadPool};
///
/// let mut pool = ThreadPool::persistent(PoolConfig::new(2)).unwrap();
/// let graph = Graph::new();
/// let mut plan = Plan::for_pool(&graph, &pool);
/// assert!(pool.compute(&graph, &mut plan).is_success());
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    released: bool,
}

impl ThreadPool {
    /// Creates a pool on the detected topology with the native platform backend.
    ///
    /// Topology detection reads sysfs on every call. Callers that build many
    /// pools should detect once and use [`ThreadPool::with_platform`].
    pub fn persistent(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_platform(config, Topology::detect(), default_platform())
    }

    /// Creates a pool with an explicit topology and platform backend.
    pub fn with_platform(
        config: PoolConfig,
        topology: Topology,
        platform: Arc<dyn PlatformOps>,
    ) -> Result<Self, PoolError> {
        let n_threads = if config.n_threads == 0 {
            default_threads()
        } else {
            config.n_threads
        };
        let poll_level = config.poll_level.min(MAX_POLL_LEVEL);

        // Secondary workers take CPUs first, the caller's thread last.
        let mut cursor = 0;
        let mut masks = vec![CpuMask::empty(); n_threads];
        for mask in masks.iter_mut().skip(1) {
            *mask = next_cpumask(&config.cpumask, config.strict_cpu, &mut cursor);
        }
        masks[0] = next_cpumask(&config.cpumask, config.strict_cpu, &mut cursor);

        let shared = Arc::new(Shared {
            generation: CachePadded::new(AtomicUsize::new(0)),
            n_threads_cur: CachePadded::new(AtomicUsize::new(n_threads)),
            barrier: Barrier::new(),
            current_chunk: CachePadded::new(AtomicUsize::new(0)),
            abort: CachePadded::new(AtomicUsize::new(NO_ABORT)),
            status: AtomicU8::new(Status::Success as u8),
            epoch: AtomicPtr::new(ptr::null_mut()),
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(config.paused),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            n_threads_max: n_threads,
            poll_level,
            priority: config.priority,
            numa: config.numa,
            chunking: config.chunking,
            masks,
            topology,
            platform,
            metrics: Metrics::new(),
            profiler: config.profile.then(Profiler::new),
        });

        // Dropping a partially built pool stops and joins what was spawned.
        let mut pool = ThreadPool {
            shared,
            handles: Vec::with_capacity(n_threads.saturating_sub(1)),
            released: false,
        };

        for ith in 1..n_threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("graphexec-worker-{ith}"))
                .spawn(move || worker::secondary_main(shared, WorkerState::new(ith)))
                .map_err(|source| PoolError::Spawn { index: ith, source })?;
            pool.handles.push(handle);
        }

        if !config.paused {
            worker::apply_placement(&pool.shared, 0);
        }

        debug!(
            n_threads,
            poll_level,
            priority = ?config.priority,
            strict = config.strict_cpu,
            paused = config.paused,
            numa_nodes = pool.shared.topology.num_nodes,
            "thread pool created"
        );
        Ok(pool)
    }

    /// Runs one graph on a pool created for this call only, placed on an
    /// already detected `topology`.
    pub fn ephemeral(
        graph: &Graph,
        plan: &mut Plan,
        topology: &Topology,
    ) -> Result<Status, PoolError> {
        let config = PoolConfig::new(plan.n_threads());
        let mut pool = Self::with_platform(config, topology.clone(), default_platform())?;
        let status = pool.compute(graph, plan);
        pool.release();
        Ok(status)
    }

    /// Executes `graph` according to `plan` and returns when every active
    /// thread is done.
    ///
    /// Returns [`Status::AllocFailed`] if the plan needs scratch and none is
    /// attached.
    ///
    /// # Panics
    ///
    /// If the pool was released, if `plan` was built for a graph with a
    /// different node count, or if the attached scratch is smaller than
    /// [`Plan::scratch_size`].
    pub fn compute(&mut self, graph: &Graph, plan: &mut Plan) -> Status {
        assert!(!self.released, "compute called on a released thread pool");
        assert_eq!(
            plan.n_tasks().len(),
            graph.len(),
            "plan was built for a graph with a different node count"
        );
        if plan.scratch_size() > 0 {
            match plan.scratch() {
                None => {
                    warn!(size = plan.scratch_size(), "plan has no scratch buffer attached");
                    return Status::AllocFailed;
                }
                Some(buffer) => assert!(
                    buffer.len() >= plan.scratch_size(),
                    "scratch buffer too small: {} < {}",
                    buffer.len(),
                    plan.scratch_size()
                ),
            }
        }

        let shared = &*self.shared;
        let mut n_threads = plan.n_threads().max(1);
        if n_threads > shared.n_threads_max {
            warn!(
                requested = n_threads,
                max = shared.n_threads_max,
                "plan wants more threads than the pool has, clamping"
            );
            n_threads = shared.n_threads_max;
        }

        let (scratch, scratch_len) = plan.scratch_parts();
        let plan: &Plan = plan;
        let generation = shared.generation.load(Ordering::Relaxed) as u64 + 1;
        let epoch = Epoch {
            graph,
            plan,
            scratch,
            scratch_len,
            generation,
        };

        // Workers of the previous epoch are past its final barrier, so this
        // state is ours until the generation bump publishes it.
        shared.current_chunk.store(0, Ordering::Relaxed);
        shared.abort.store(NO_ABORT, Ordering::Relaxed);
        shared.status.store(Status::Success as u8, Ordering::Relaxed);
        shared
            .epoch
            .store(&epoch as *const Epoch<'_> as *mut (), Ordering::Relaxed);

        self.kickoff(n_threads);
        worker::compute_thread(shared, 0);

        shared.epoch.store(ptr::null_mut(), Ordering::Relaxed);

        if shared.numa != NumaStrategy::Disabled && shared.topology.is_numa() {
            if let Err(err) = shared.platform.apply_affinity(&shared.topology.all_cpus()) {
                warn!(%err, "failed to reset numa placement of the calling thread");
            }
        }

        let status = Status::from_u8(shared.status.load(Ordering::Relaxed));
        if status == Status::Aborted {
            Metrics::add(&shared.metrics.aborts, 1);
            debug!(
                generation,
                abort_at = shared.abort.load(Ordering::Relaxed),
                "epoch aborted"
            );
        }
        trace!(generation, n_threads, ?status, "epoch finished");
        status
    }

    /// Plans `graph` against this pool, allocates scratch, and computes it.
    pub fn run(&mut self, graph: &Graph) -> Status {
        let mut plan = Plan::for_pool(graph, self);
        if let Err(err) = plan.alloc_scratch() {
            warn!(%err, "scratch allocation failed");
            return Status::AllocFailed;
        }
        self.compute(graph, &mut plan)
    }

    fn kickoff(&self, n_threads: usize) {
        let shared = &*self.shared;
        let _guard = shared.lock();

        shared.n_threads_cur.store(n_threads, Ordering::Relaxed);
        // Publishes the active count and the epoch to workers.
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Metrics::add(&shared.metrics.epochs, 1);

        if shared.pause.load(Ordering::Relaxed) {
            debug!(generation, n_threads, "kickoff resumes paused pool");
            worker::apply_placement(shared, 0);
            shared.resume_locked();
        } else {
            debug!(generation, n_threads, "kickoff");
            shared.cond.notify_all();
        }
    }

    /// Asks workers to park once their current wait ends. Idempotent.
    pub fn pause(&self) {
        let shared = &*self.shared;
        let _guard = shared.lock();
        if !shared.pause.load(Ordering::Relaxed) && !shared.stop.load(Ordering::Relaxed) {
            debug!("pausing thread pool");
            shared.pause.store(true, Ordering::SeqCst);
            shared.cond.notify_all();
        }
    }

    /// Wakes parked workers. Idempotent.
    pub fn resume(&self) {
        let shared = &*self.shared;
        let _guard = shared.lock();
        if shared.pause.load(Ordering::Relaxed) {
            debug!("resuming thread pool");
            shared.resume_locked();
        }
    }

    /// Stops and joins all secondary workers. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }

        {
            let shared = &*self.shared;
            let _guard = shared.lock();
            shared.stop.store(true, Ordering::SeqCst);
            shared.pause.store(false, Ordering::SeqCst);
            shared.cond.notify_all();
        }

        for (i, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(ith = i + 1, "worker thread panicked");
            }
        }

        self.released = true;
        debug!("thread pool released");
    }

    pub fn state(&self) -> PoolState {
        if self.shared.stop.load(Ordering::SeqCst) {
            PoolState::Stopped
        } else if self.shared.pause.load(Ordering::SeqCst) {
            PoolState::Paused
        } else {
            PoolState::Running
        }
    }

    /// Worker capacity, including the calling thread.
    pub fn n_threads_max(&self) -> usize {
        self.shared.n_threads_max
    }

    /// Epochs kicked off so far.
    pub fn generation(&self) -> usize {
        self.shared.generation.load(Ordering::Relaxed)
    }

    /// CPU mask assigned to each worker, indexed by worker.
    pub fn worker_masks(&self) -> &[CpuMask] {
        &self.shared.masks
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot(self.shared.barrier.passed())
    }

    /// Per-node spans, if the pool was created with profiling on.
    pub fn profiler(&self) -> Option<&Profiler> {
        self.shared.profiler.as_ref()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.release();
    }
}
