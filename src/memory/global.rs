//! `#[global_allocator]` adapter over the segregated allocator.

use super::{BlockAllocator, SegregatedAllocator, BLOCK_ALIGN};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::{self, NonNull};

/// Process-wide heap backed by a [`SegregatedAllocator`].
///
/// ```rust,ignore
/// use reactornet::memory::PoolGlobalAlloc;
///
/// #[global_allocator]
/// static HEAP: PoolGlobalAlloc = PoolGlobalAlloc::new();
/// ```
///
/// Layouts aligned beyond [`BLOCK_ALIGN`] are routed to [`System`].
pub struct PoolGlobalAlloc {
    pool: SegregatedAllocator,
}

impl PoolGlobalAlloc {
    pub const fn new() -> Self {
        Self {
            pool: SegregatedAllocator::new(),
        }
    }

    /// The allocator behind this heap, for diagnostics.
    pub fn pool(&self) -> &SegregatedAllocator {
        &self.pool
    }
}

impl Default for PoolGlobalAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for PoolGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return System.alloc(layout);
        }
        match self.pool.allocate(layout.size().max(1)) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return System.alloc_zeroed(layout);
        }
        match self.pool.allocate_zeroed(1, layout.size().max(1)) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > BLOCK_ALIGN {
            return System.dealloc(ptr, layout);
        }
        self.pool.free(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return System.realloc(ptr, layout, new_size);
        }
        match self.pool.reallocate(NonNull::new(ptr), new_size.max(1)) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}
