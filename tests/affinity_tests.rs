use graphexec::{
    ComputeParams, CpuMask, Graph, NumaStrategy, Operation, PlatformError, PlatformOps, PoolConfig,
    Priority, Shape, ThreadPool, Topology,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Records placement requests per thread name instead of applying them.
#[derive(Default)]
struct Recorder {
    affinity: Mutex<Vec<(String, CpuMask)>>,
    priority: Mutex<Vec<(String, Priority)>>,
    fail_priority: bool,
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("main").to_string()
}

impl Recorder {
    fn masks_for(&self, name: &str) -> Vec<CpuMask> {
        self.affinity
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, m)| *m)
            .collect()
    }
}

impl PlatformOps for Recorder {
    fn apply_priority(&self, priority: Priority) -> Result<(), PlatformError> {
        self.priority.lock().unwrap().push((thread_name(), priority));
        if self.fail_priority {
            Err(PlatformError::Unsupported("thread priority"))
        } else {
            Ok(())
        }
    }

    fn apply_affinity(&self, mask: &CpuMask) -> Result<(), PlatformError> {
        self.affinity.lock().unwrap().push((thread_name(), *mask));
        Ok(())
    }
}

struct Wide(AtomicUsize);

impl Operation for Wide {
    fn name(&self) -> &str {
        "wide"
    }

    fn n_tasks(&self, _shape: &Shape, n_threads: usize) -> usize {
        n_threads
    }

    fn compute(&self, _shape: &Shape, _params: &mut ComputeParams<'_>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn one_node_graph() -> (Graph, Arc<Wide>) {
    let op = Arc::new(Wide(AtomicUsize::new(0)));
    let mut graph = Graph::new();
    graph.add("wide", op.clone(), Shape::vector(64));
    (graph, op)
}

#[test]
fn test_strict_masks_assign_workers_first() {
    let recorder = Arc::new(Recorder::default());
    let config = PoolConfig::new(4)
        .with_poll_level(0)
        .with_cpumask(CpuMask::from_cpus([1, 5, 9]), true);
    let mut pool =
        ThreadPool::with_platform(config, Topology::uniform(16), recorder.clone()).unwrap();

    let masks: Vec<Vec<usize>> = pool.worker_masks().iter().map(|m| m.iter().collect()).collect();
    // Workers 1..3 take 1, 5, 9; the caller wraps around to 1.
    assert_eq!(masks, vec![vec![1], vec![1], vec![5], vec![9]]);

    let (graph, op) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    assert_eq!(op.0.load(Ordering::SeqCst), 4);

    pool.release();
    assert_eq!(recorder.masks_for("graphexec-worker-2"), vec![CpuMask::from_cpus([5])]);
    assert_eq!(recorder.masks_for("graphexec-worker-3"), vec![CpuMask::from_cpus([9])]);
}

#[test]
fn test_non_strict_masks_share_global_mask() {
    let global = CpuMask::from_cpus([0, 2, 4]);
    let config = PoolConfig::new(3).with_cpumask(global, false);
    let pool = ThreadPool::with_platform(config, Topology::uniform(8), Arc::new(Recorder::default()))
        .unwrap();
    assert!(pool.worker_masks().iter().all(|m| *m == global));
}

#[test]
fn test_empty_mask_leaves_affinity_alone() {
    let recorder = Arc::new(Recorder::default());
    let mut pool =
        ThreadPool::with_platform(PoolConfig::new(3), Topology::uniform(8), recorder.clone())
            .unwrap();
    let (graph, _) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    pool.release();
    assert!(recorder.affinity.lock().unwrap().is_empty());
}

#[test]
fn test_priority_failures_are_not_fatal() {
    let recorder = Arc::new(Recorder {
        fail_priority: true,
        ..Recorder::default()
    });
    let config = PoolConfig::new(3)
        .with_poll_level(0)
        .with_priority(Priority::High);
    let mut pool = ThreadPool::with_platform(config, Topology::uniform(8), recorder.clone()).unwrap();

    let (graph, op) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    assert_eq!(op.0.load(Ordering::SeqCst), 3);

    pool.release();
    let priorities = recorder.priority.lock().unwrap();
    assert_eq!(priorities.len(), 3);
    assert!(priorities.iter().all(|(_, p)| *p == Priority::High));
}

#[test]
fn test_distribute_places_workers_round_robin() {
    let recorder = Arc::new(Recorder::default());
    let topology = Topology::from_nodes(vec![(0, vec![0, 1]), (1, vec![2, 3])]);
    let config = PoolConfig::new(4)
        .with_poll_level(0)
        .with_numa(NumaStrategy::Distribute);
    let mut pool = ThreadPool::with_platform(config, topology, recorder.clone()).unwrap();

    let (graph, _) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    pool.release();

    let node0 = CpuMask::from_cpus([0, 1]);
    let node1 = CpuMask::from_cpus([2, 3]);
    assert_eq!(recorder.masks_for("graphexec-worker-1"), vec![node1]);
    assert_eq!(recorder.masks_for("graphexec-worker-2"), vec![node0]);
    assert_eq!(recorder.masks_for("graphexec-worker-3"), vec![node1]);

    // The caller is placed on node 0 for the epoch, then released to all CPUs.
    let caller = thread_name();
    assert_eq!(
        recorder.masks_for(&caller),
        vec![node0, CpuMask::from_cpus([0, 1, 2, 3])]
    );
}

#[test]
fn test_numa_strategy_ignored_on_single_node() {
    let recorder = Arc::new(Recorder::default());
    let config = PoolConfig::new(2).with_numa(NumaStrategy::Isolate);
    let mut pool = ThreadPool::with_platform(config, Topology::uniform(4), recorder.clone()).unwrap();

    let (graph, _) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    pool.release();
    assert!(recorder.affinity.lock().unwrap().is_empty());
}

#[test]
fn test_external_numa_mask() {
    let recorder = Arc::new(Recorder::default());
    let topology = Topology::from_nodes(vec![(0, vec![0, 1]), (1, vec![2, 3])]);
    let external = CpuMask::from_cpus([1, 3]);
    let config = PoolConfig::new(2).with_numa(NumaStrategy::External(external));
    let mut pool = ThreadPool::with_platform(config, topology, recorder.clone()).unwrap();

    let (graph, _) = one_node_graph();
    assert!(pool.run(&graph).is_success());
    pool.release();
    assert_eq!(recorder.masks_for("graphexec-worker-1"), vec![external]);
}
