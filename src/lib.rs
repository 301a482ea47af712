//! # graphexec - Multi-threaded Computation Graph Executor
//!
//! Executes a pre-ordered computation graph on a persistent pool of CPU
//! threads. The calling thread takes part as worker 0; every node is
//! computed by all threads the plan assigns to it, and threads meet at a
//! spinning barrier between nodes.
//!
//! ## Architecture
//!
//! - **Plan**: per-node task counts and the shared scratch size for one graph
//! - **Thread Pool**: workers that wake on a generation counter, busy-polling
//!   first and sleeping on a condition variable after
//! - **Barrier**: two-counter spin barrier separating nodes
//! - **Chunk Dispatcher**: splits a node's output space into chunks that idle
//!   threads claim from a shared cursor
//! - **Placement**: per-worker CPU masks, scheduling priority and NUMA strategy
//!
//! ## Example
//!
//! ```
//! use graphexec::{ComputeParams, Graph, Operation, PoolConfig, Shape, ThreadPool};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountRows(AtomicUsize);
//!
//! impl Operation for CountRows {
//!     fn name(&self) -> &str {
//!         "count_rows"
//!     }
//!
//!     fn n_tasks(&self, _shape: &Shape, n_threads: usize) -> usize {
//!         n_threads
//!     }
//!
//!     fn compute(&self, shape: &Shape, params: &mut ComputeParams<'_>) {
//!         params.for_each_chunk(shape.nrows(), 1, |chunk| {
//!             self.0.fetch_add(chunk.rows.len(), Ordering::Relaxed);
//!         });
//!     }
//! }
//!
//! let op = Arc::new(CountRows(AtomicUsize::new(0)));
//! let mut graph = Graph::new();
//! graph.add("rows", op.clone(), Shape::matrix(8, 1000));
//!
//! let mut pool = ThreadPool::persistent(PoolConfig::new(4)).unwrap();
//! assert!(pool.run(&graph).is_success());
//! assert_eq!(op.0.load(Ordering::Relaxed), 1000);
//! ```

pub mod affinity;
pub mod barrier;
pub mod chunk;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod params;
pub mod plan;
pub mod pool;
pub mod profile;
pub mod scratch;
pub mod topology;
pub mod worker;

pub use affinity::{CpuMask, NoopOps, PlatformOps, PortableOps, Priority};
#[cfg(target_os = "linux")]
pub use affinity::LinuxOps;
pub use barrier::Barrier;
pub use chunk::{Chunk, ChunkConfig, ChunkPlan};
pub use error::{PlatformError, PoolError, ScratchError, Status};
pub use graph::{Graph, Node, Operation, Shape};
pub use metrics::{Metrics, MetricsSnapshot};
pub use params::ComputeParams;
pub use plan::{Plan, plan};
pub use pool::{PoolConfig, PoolState, ThreadPool};
pub use profile::Profiler;
pub use scratch::ScratchBuffer;
pub use topology::{NumaStrategy, Topology};

/// Plans and runs `graph` once on a throwaway pool.
pub fn compute(
    graph: &Graph,
    n_threads: usize,
    topology: &Topology,
) -> Result<Status, PoolError> {
    let mut plan = plan(graph, n_threads);
    plan.alloc_scratch()?;
    ThreadPool::ephemeral(graph, &mut plan, topology)
}
