//! Dynamic chunk dispatch for one node's 2-D iteration space.
//!
//! Rows x columns are cut into chunks. Each thread first takes the chunk with
//! its own index, which needs no atomics, then claims further chunks from a
//! shared cursor until none are left. Threads that finish their chunks early
//! pick up more work, which evens out ragged per-chunk costs.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tuning knobs for chunking. Performance only; coverage does not depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Nominal chunk edge.
    pub chunk_size: usize,
    /// Chunk edge used when either dimension is 1.
    pub wide_chunk_size: usize,
    /// Below this many chunks per thread, fall back to a static split.
    pub min_chunks_per_thread: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16,
            wide_chunk_size: 64,
            min_chunks_per_thread: 4,
        }
    }
}

/// How one node's `nr0 x nr1` space is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub nr0: usize,
    pub nr1: usize,
    pub nchunk0: usize,
    pub nchunk1: usize,
    /// Rows per chunk.
    pub dr0: usize,
    /// Columns per chunk.
    pub dr1: usize,
}

/// One claimed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl ChunkPlan {
    /// Plans chunks for `nth` threads.
    ///
    /// On NUMA hosts, or when there would be fewer than
    /// `min_chunks_per_thread * nth` chunks, the larger dimension is split
    /// once per thread and the smaller one not at all. That gives up load
    /// balancing in exchange for less cross-node memory traffic.
    pub fn new(nr0: usize, nr1: usize, nth: usize, numa: bool, config: &ChunkConfig) -> Self {
        if nr0 == 0 || nr1 == 0 {
            return ChunkPlan {
                nr0,
                nr1,
                nchunk0: 0,
                nchunk1: 0,
                dr0: 0,
                dr1: 0,
            };
        }
        let nth = nth.max(1);

        let chunk_size = if nr0 == 1 || nr1 == 1 {
            config.wide_chunk_size
        } else {
            config.chunk_size
        }
        .max(1);

        let mut nchunk0 = nr0.div_ceil(chunk_size);
        let mut nchunk1 = nr1.div_ceil(chunk_size);

        // Config values may come from a file, so saturate instead of wrapping.
        let wanted = nth.saturating_mul(config.min_chunks_per_thread);
        if nchunk0.saturating_mul(nchunk1) < wanted || numa {
            if nr0 > nr1 {
                nchunk0 = nth;
                nchunk1 = 1;
            } else {
                nchunk0 = 1;
                nchunk1 = nth;
            }
        }

        ChunkPlan {
            nr0,
            nr1,
            nchunk0,
            nchunk1,
            dr0: nr0.div_ceil(nchunk0),
            dr1: nr1.div_ceil(nchunk1),
        }
    }

    pub fn total(&self) -> usize {
        self.nchunk0 * self.nchunk1
    }

    /// Row and column ranges of chunk `index`. Trailing chunks may be empty
    /// when a dimension is split more ways than it has elements.
    pub fn chunk(&self, index: usize) -> Chunk {
        let i0 = index % self.nchunk0;
        let i1 = index / self.nchunk0;
        let r0 = (self.dr0 * i0).min(self.nr0);
        let r1 = (self.dr1 * i1).min(self.nr1);
        Chunk {
            index,
            rows: r0..(r0 + self.dr0).min(self.nr0),
            cols: r1..(r1 + self.dr1).min(self.nr1),
        }
    }
}

/// Runs the claim loop for thread `ith` of `nth` over chunks `0..total`.
///
/// `cursor` counts claims made beyond the first round and must read 0 when
/// the node starts. Every index in `0..total` is passed to `f` exactly once
/// across all participating threads. Returns how many chunks were claimed
/// from the cursor by this thread.
pub fn claim_chunks<F>(ith: usize, nth: usize, total: usize, cursor: &AtomicUsize, mut f: F) -> usize
where
    F: FnMut(usize),
{
    let mut claimed = 0;
    let mut current = ith;
    while current < total {
        f(current);
        if nth >= total {
            break;
        }
        current = nth + cursor.fetch_add(1, Ordering::Relaxed);
        if current < total {
            claimed += 1;
        }
    }
    claimed
}

/// Claims and runs chunks of `plan` on thread `ith` of `nth`.
pub fn for_each_chunk<F>(plan: &ChunkPlan, ith: usize, nth: usize, cursor: &AtomicUsize, mut f: F) -> usize
where
    F: FnMut(Chunk),
{
    claim_chunks(ith, nth, plan.total(), cursor, |index| f(plan.chunk(index)))
}
