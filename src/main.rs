use graphexec::{ComputeParams, Graph, Operation, PoolConfig, Shape, ThreadPool};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Shared integer tensor storage for the demo ops.
struct Buffer(Vec<AtomicU64>);

impl Buffer {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Buffer((0..len).map(|_| AtomicU64::new(0)).collect()))
    }

    fn get(&self, i: usize) -> u64 {
        self.0[i].load(Ordering::Relaxed)
    }

    fn set(&self, i: usize, v: u64) {
        self.0[i].store(v, Ordering::Relaxed);
    }
}

/// a[r, c] = (r + c) % 7
struct Fill {
    out: Arc<Buffer>,
}

impl Operation for Fill {
    fn name(&self) -> &str {
        "fill"
    }

    fn n_tasks(&self, _shape: &Shape, n_threads: usize) -> usize {
        n_threads
    }

    fn compute(&self, shape: &Shape, params: &mut ComputeParams<'_>) {
        let cols = shape.ne[0];
        params.for_each_chunk(shape.nrows(), cols, |chunk| {
            for r in chunk.rows.clone() {
                for c in chunk.cols.clone() {
                    self.out.set(r * cols + c, ((r + c) % 7) as u64);
                }
            }
        });
    }
}

/// y[r] = sum over c of a[r, c] * (c % 3)
struct MatVec {
    a: Arc<Buffer>,
    y: Arc<Buffer>,
    cols: usize,
}

impl Operation for MatVec {
    fn name(&self) -> &str {
        "matvec"
    }

    fn n_tasks(&self, _shape: &Shape, n_threads: usize) -> usize {
        n_threads
    }

    fn compute(&self, shape: &Shape, params: &mut ComputeParams<'_>) {
        params.for_each_chunk(shape.ne[0], 1, |chunk| {
            for r in chunk.rows {
                let dot: u64 = (0..self.cols)
                    .map(|c| self.a.get(r * self.cols + c) * (c % 3) as u64)
                    .sum();
                self.y.set(r, dot);
            }
        });
    }
}

/// Sums a vector, accumulating in this thread's scratch before publishing.
struct Sum {
    input: Arc<Buffer>,
    total: AtomicU64,
}

impl Operation for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn n_tasks(&self, _shape: &Shape, n_threads: usize) -> usize {
        n_threads
    }

    fn scratch_size(&self, _shape: &Shape, n_tasks: usize) -> usize {
        8 * n_tasks
    }

    fn compute(&self, shape: &Shape, params: &mut ComputeParams<'_>) {
        params.thread_scratch()[..8].copy_from_slice(&0u64.to_ne_bytes());

        let mut partial = 0u64;
        params.for_each_chunk(shape.ne[0], 1, |chunk| {
            partial += chunk.rows.map(|i| self.input.get(i)).sum::<u64>();
        });

        let slot = &mut params.thread_scratch()[..8];
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(slot);
        let acc = u64::from_ne_bytes(bytes) + partial;
        slot.copy_from_slice(&acc.to_ne_bytes());
        self.total.fetch_add(acc, Ordering::Relaxed);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let n_threads: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let iterations: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(100);
    let trace_path = env::var("GRAPHEXEC_TRACE").ok();

    println!("graphexec - computation graph executor\n");

    let (rows, cols) = (512, 256);
    let a = Buffer::new(rows * cols);
    let y = Buffer::new(rows);
    let sum = Arc::new(Sum {
        input: y.clone(),
        total: AtomicU64::new(0),
    });

    let mut graph = Graph::new();
    graph.add_noop("input");
    graph.add("fill", Arc::new(Fill { out: a.clone() }), Shape::matrix(cols, rows));
    graph.add(
        "matvec",
        Arc::new(MatVec {
            a: a.clone(),
            y: y.clone(),
            cols,
        }),
        Shape::vector(rows),
    );
    graph.add("sum", sum.clone(), Shape::vector(rows));

    let config = PoolConfig::new(n_threads).with_profiling(trace_path.is_some());
    let mut pool = match ThreadPool::persistent(config) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to create thread pool: {}", e);
            std::process::exit(1);
        }
    };
    println!("Pool with {} threads, {} nodes", pool.n_threads_max(), graph.len());

    let start = Instant::now();
    for _ in 0..iterations {
        let status = pool.run(&graph);
        if !status.is_success() {
            eprintln!("Epoch failed: {:?}", status);
            std::process::exit(1);
        }
    }
    let duration = start.elapsed();

    let expected: u64 = (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| ((r + c) % 7) as u64 * (c % 3) as u64)
                .sum::<u64>()
        })
        .sum();
    let total = sum.total.load(Ordering::Relaxed);
    println!("  Ran {} epochs in {:?}", iterations, duration);
    println!(
        "  Sum result: {} (expected: {})",
        total,
        expected * iterations as u64
    );

    let metrics = pool.metrics();
    println!("\nMetrics:");
    println!("  epochs/s:        {:.1}", iterations as f64 / duration.as_secs_f64());
    println!("  barrier passes:  {}", metrics.barrier_passes);
    println!("  dynamic claims:  {}", metrics.dynamic_claims);
    println!("  poll rounds:     {}", metrics.poll_rounds);
    println!("  sleeps:          {}", metrics.sleeps);

    if let (Some(path), Some(profiler)) = (trace_path, pool.profiler()) {
        match profiler.export_to_file(&path) {
            Ok(()) => println!("\nTrace written to {}", path),
            Err(e) => eprintln!("Failed to write trace: {}", e),
        }
    }

    pool.release();
}
