//! Execution planning: thread count and scratch sizing for one graph.

use crate::error::ScratchError;
use crate::graph::Graph;
use crate::pool::ThreadPool;
use crate::scratch::{CACHE_LINE_SIZE, ScratchBuffer};
use std::fmt;
use std::thread;

/// Polled by thread 0 after every executed node; `true` stops the epoch.
pub type AbortCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// Per-graph execution plan. Computed once, read-only while an epoch runs.
pub struct Plan {
    n_threads: usize,
    n_tasks: Vec<usize>,
    scratch_size: usize,
    scratch: Option<ScratchBuffer>,
    abort: Option<AbortCallback>,
}

/// One thread per available CPU, or 4 if that cannot be determined.
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Plans `graph` for at most `n_threads` threads (0 = one per CPU).
///
/// The epoch's thread count is the largest task count any node asks for.
/// Scratch is sized for the hungriest node, not the sum, because nodes run
/// one after another and reuse the same buffer.
pub fn plan(graph: &Graph, n_threads: usize) -> Plan {
    let budget = if n_threads == 0 {
        default_threads()
    } else {
        n_threads
    };

    let mut max_tasks = 1;
    let mut scratch_size = 0;
    let mut n_tasks = Vec::with_capacity(graph.len());

    for node in graph.nodes() {
        let tasks = node.n_tasks(budget).clamp(1, budget);
        max_tasks = max_tasks.max(tasks);
        scratch_size = scratch_size.max(node.scratch_size(tasks));
        n_tasks.push(tasks);
    }

    if scratch_size > 0 {
        // An impossible request must still reach the allocator and fail there.
        scratch_size = scratch_size.saturating_add(CACHE_LINE_SIZE.saturating_mul(budget));
    }

    Plan {
        n_threads: max_tasks.min(budget),
        n_tasks,
        scratch_size,
        scratch: None,
        abort: None,
    }
}

impl Plan {
    pub fn new(graph: &Graph, n_threads: usize) -> Self {
        plan(graph, n_threads)
    }

    /// Plans against a pool's capacity.
    pub fn for_pool(graph: &Graph, pool: &ThreadPool) -> Self {
        plan(graph, pool.n_threads_max())
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Task count of every node, in graph order.
    pub fn n_tasks(&self) -> &[usize] {
        &self.n_tasks
    }

    /// Minimum scratch size in bytes; 0 when no node needs scratch.
    pub fn scratch_size(&self) -> usize {
        self.scratch_size
    }

    pub fn scratch(&self) -> Option<&ScratchBuffer> {
        self.scratch.as_ref()
    }

    /// Attaches a caller-owned buffer, returning the previous one.
    pub fn attach_scratch(&mut self, buffer: ScratchBuffer) -> Option<ScratchBuffer> {
        self.scratch.replace(buffer)
    }

    pub fn with_scratch(mut self, buffer: ScratchBuffer) -> Self {
        self.scratch = Some(buffer);
        self
    }

    pub fn take_scratch(&mut self) -> Option<ScratchBuffer> {
        self.scratch.take()
    }

    /// Allocates a buffer of [`scratch_size`](Self::scratch_size) bytes unless
    /// a large enough one is already attached.
    pub fn alloc_scratch(&mut self) -> Result<(), ScratchError> {
        if self.scratch_size == 0 {
            return Ok(());
        }
        if self.scratch.as_ref().is_some_and(|s| s.len() >= self.scratch_size) {
            return Ok(());
        }
        self.scratch = Some(ScratchBuffer::try_new(self.scratch_size)?);
        Ok(())
    }

    pub fn set_abort<F>(&mut self, callback: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.abort = Some(Box::new(callback));
    }

    pub fn with_abort<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.set_abort(callback);
        self
    }

    pub fn clear_abort(&mut self) {
        self.abort = None;
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.abort.as_ref().is_some_and(|abort| abort())
    }

    /// Raw view of the attached scratch, or a null/empty one.
    pub(crate) fn scratch_parts(&mut self) -> (*mut u8, usize) {
        match self.scratch.as_mut() {
            Some(buffer) => (buffer.as_mut_ptr(), buffer.len()),
            None => (std::ptr::null_mut(), 0),
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("n_threads", &self.n_threads)
            .field("n_tasks", &self.n_tasks)
            .field("scratch_size", &self.scratch_size)
            .field("scratch", &self.scratch)
            .field("abort", &self.abort.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Operation, Shape};
    use crate::params::ComputeParams;
    use std::sync::Arc;

    struct Wants {
        tasks: usize,
        scratch_per_task: usize,
    }

    impl Operation for Wants {
        fn name(&self) -> &str {
            "wants"
        }

        fn n_tasks(&self, _shape: &Shape, _n_threads: usize) -> usize {
            self.tasks
        }

        fn scratch_size(&self, _shape: &Shape, n_tasks: usize) -> usize {
            self.scratch_per_task * n_tasks
        }

        fn compute(&self, _shape: &Shape, _params: &mut ComputeParams<'_>) {}
    }

    fn wants(tasks: usize, scratch_per_task: usize) -> Arc<dyn Operation> {
        Arc::new(Wants {
            tasks,
            scratch_per_task,
        })
    }

    #[test]
    fn test_active_threads_is_max_task_count() {
        let mut graph = Graph::new();
        graph.add("a", wants(1, 0), Shape::vector(8));
        graph.add("b", wants(4, 0), Shape::vector(8));
        graph.add("c", wants(2, 0), Shape::vector(8));

        let plan = plan(&graph, 4);
        assert_eq!(plan.n_threads(), 4);
        assert_eq!(plan.n_tasks(), &[1, 4, 2]);
        assert_eq!(plan.scratch_size(), 0);
    }

    #[test]
    fn test_task_counts_clamped_to_budget() {
        let mut graph = Graph::new();
        graph.add("big", wants(64, 0), Shape::vector(8));
        graph.add("zero", wants(0, 0), Shape::vector(8));

        let plan = plan(&graph, 3);
        assert_eq!(plan.n_threads(), 3);
        assert_eq!(plan.n_tasks(), &[3, 1]);
    }

    #[test]
    fn test_scratch_is_max_not_sum() {
        let mut graph = Graph::new();
        graph.add("a", wants(2, 100), Shape::vector(8));
        graph.add("b", wants(2, 300), Shape::vector(8));
        graph.add("c", wants(2, 50), Shape::vector(8));

        let plan = plan(&graph, 2);
        assert_eq!(plan.scratch_size(), 600 + CACHE_LINE_SIZE * 2);
    }

    #[test]
    fn test_noops_do_not_raise_requirements() {
        let mut graph = Graph::new();
        graph.add_noop("start");
        graph.add("a", wants(2, 0), Shape::vector(8));
        graph.add_noop("end");

        let plan = plan(&graph, 8);
        assert_eq!(plan.n_threads(), 2);
        assert_eq!(plan.n_tasks(), &[1, 2, 1]);
    }

    #[test]
    fn test_huge_scratch_request_fails_allocation() {
        let mut graph = Graph::new();
        graph.add("huge", wants(1, usize::MAX), Shape::vector(8));

        let mut plan = plan(&graph, 4);
        assert_eq!(plan.scratch_size(), usize::MAX);
        assert_eq!(
            plan.alloc_scratch(),
            Err(ScratchError::Layout { size: usize::MAX })
        );
        assert!(plan.scratch().is_none());
    }

    #[test]
    fn test_zero_budget_uses_default() {
        let mut graph = Graph::new();
        graph.add("a", wants(usize::MAX, 0), Shape::vector(8));
        assert_eq!(plan(&graph, 0).n_threads(), default_threads());
    }

    #[test]
    fn test_alloc_scratch_reuses_large_enough_buffer() {
        let mut graph = Graph::new();
        graph.add("a", wants(1, 10), Shape::vector(8));
        let mut plan = plan(&graph, 1);
        assert!(plan.scratch().is_none());

        plan.attach_scratch(ScratchBuffer::try_new(4096).unwrap());
        plan.alloc_scratch().unwrap();
        assert_eq!(plan.scratch().map(|s| s.len()), Some(4096));

        plan.attach_scratch(ScratchBuffer::try_new(1).unwrap());
        plan.alloc_scratch().unwrap();
        assert_eq!(plan.scratch().map(|s| s.len()), Some(plan.scratch_size()));
    }

    #[test]
    fn test_abort_callback() {
        let graph = Graph::new();
        let mut plan = plan(&graph, 1);
        assert!(!plan.should_abort());
        plan.set_abort(|| true);
        assert!(plan.should_abort());
        plan.clear_abort();
        assert!(!plan.should_abort());
    }
}
