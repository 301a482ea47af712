//! Per-thread view handed to an operation while it computes one node.

use crate::chunk::{Chunk, ChunkConfig, ChunkPlan, for_each_chunk};
use crate::scratch::thread_slice_range;
use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;

pub struct ComputeParams<'a> {
    ith: usize,
    nth: usize,
    scratch: *mut u8,
    scratch_len: usize,
    cursor: &'a AtomicUsize,
    chunking: &'a ChunkConfig,
    numa: bool,
    pub(crate) dynamic_claims: usize,
    _scratch: PhantomData<&'a mut [u8]>,
}

impl<'a> ComputeParams<'a> {
    /// # Safety
    ///
    /// `scratch` must be valid for `scratch_len` bytes for `'a`, and no other
    /// thread may touch this thread's slice (see [`thread_slice_range`]) while
    /// the params are alive.
    pub(crate) unsafe fn new(
        ith: usize,
        nth: usize,
        scratch: *mut u8,
        scratch_len: usize,
        cursor: &'a AtomicUsize,
        chunking: &'a ChunkConfig,
        numa: bool,
    ) -> Self {
        ComputeParams {
            ith,
            nth,
            scratch,
            scratch_len,
            cursor,
            chunking,
            numa,
            dynamic_claims: 0,
            _scratch: PhantomData,
        }
    }

    /// Index of this thread among the node's tasks.
    pub fn ith(&self) -> usize {
        self.ith
    }

    /// Number of threads running this node.
    pub fn nth(&self) -> usize {
        self.nth
    }

    /// This thread's private, cache-line aligned slice of the epoch scratch buffer.
    pub fn thread_scratch(&mut self) -> &mut [u8] {
        let range = thread_slice_range(self.scratch_len, self.ith, self.nth);
        if range.is_empty() {
            return &mut [];
        }
        // Slices for distinct `ith` are disjoint and inside the buffer.
        unsafe { std::slice::from_raw_parts_mut(self.scratch.add(range.start), range.len()) }
    }

    pub fn chunk_plan(&self, nr0: usize, nr1: usize) -> ChunkPlan {
        ChunkPlan::new(nr0, nr1, self.nth, self.numa, self.chunking)
    }

    /// Splits `nr0 x nr1` into chunks and runs `f` on every chunk this thread
    /// claims. Across all threads of the node each chunk runs exactly once.
    ///
    /// The shared cursor is reset only between nodes, so call this at most
    /// once per node.
    pub fn for_each_chunk<F>(&mut self, nr0: usize, nr1: usize, f: F)
    where
        F: FnMut(Chunk),
    {
        let plan = self.chunk_plan(nr0, nr1);
        self.dynamic_claims += for_each_chunk(&plan, self.ith, self.nth, self.cursor, f);
    }
}
