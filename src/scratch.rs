use crate::error::ScratchError;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Alignment and per-thread padding unit for scratch memory.
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache-line aligned scratch memory shared by the threads of one epoch.
///
/// The buffer is allocated once, before `compute()`, and never grows during
/// execution. Threads carve it into disjoint per-thread slices with
/// [`thread_slice_range`], so no locking is needed inside a node.
pub struct ScratchBuffer {
    base_ptr: NonNull<u8>,
    capacity: usize,
}

impl ScratchBuffer {
    /// Allocates `capacity` zeroed bytes.
    pub fn try_new(capacity: usize) -> Result<Self, ScratchError> {
        if capacity == 0 {
            return Ok(Self::empty());
        }
        let layout = Layout::from_size_align(capacity, CACHE_LINE_SIZE)
            .map_err(|_| ScratchError::Layout { size: capacity })?;

        let ptr = unsafe { alloc_zeroed(layout) };

        let base_ptr = NonNull::new(ptr).ok_or(ScratchError::OutOfMemory { size: capacity })?;
        Ok(Self { base_ptr, capacity })
    }

    pub fn empty() -> Self {
        Self {
            base_ptr: NonNull::dangling(),
            capacity: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base_ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base_ptr.as_ptr(), self.capacity) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        // Same layout as try_new, which already validated it.
        if let Ok(layout) = Layout::from_size_align(self.capacity, CACHE_LINE_SIZE) {
            unsafe { dealloc(self.base_ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("capacity", &self.capacity)
            .finish()
    }
}

// The buffer owns its memory outright.
unsafe impl Send for ScratchBuffer {}
unsafe impl Sync for ScratchBuffer {}

/// Byte range of thread `ith`'s slice when `len` bytes are split `nth` ways.
///
/// Slices are cache-line multiples, so they start on cache-line boundaries
/// and never share a line with a neighbour.
pub fn thread_slice_range(len: usize, ith: usize, nth: usize) -> std::ops::Range<usize> {
    if nth == 0 || ith >= nth {
        return 0..0;
    }
    let stride = (len / nth) / CACHE_LINE_SIZE * CACHE_LINE_SIZE;
    let start = ith * stride;
    start..start + stride
}
