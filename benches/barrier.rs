//! Barrier round-trip latency using criterion.
//!
//! Measures how long one episode of the spin barrier takes for a range of
//! participant counts.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use graphexec::Barrier;
use std::thread;
use std::time::{Duration, Instant};

fn bench_barrier(c: &mut Criterion) {
    let max_threads = num_cpus::get().clamp(2, 8);

    let mut group = c.benchmark_group("barrier");
    group.sample_size(20);

    for n_threads in (1..=max_threads).filter(|n| n.is_power_of_two()) {
        group.bench_with_input(BenchmarkId::new("threads", n_threads), &n_threads, |b, &n| {
            b.iter_custom(|iters| {
                let barrier = Barrier::new();
                let mut elapsed = Duration::ZERO;

                thread::scope(|s| {
                    for _ in 1..n {
                        s.spawn(|| {
                            for _ in 0..iters {
                                barrier.wait(n);
                            }
                        });
                    }

                    let start = Instant::now();
                    for _ in 0..iters {
                        barrier.wait(n);
                    }
                    elapsed = start.elapsed();
                });

                elapsed
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_barrier);
criterion_main!(benches);
