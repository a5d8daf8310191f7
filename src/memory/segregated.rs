//! Lock-free segregated-size block allocator.
//!
//! Blocks are grouped into 32 power-of-two size classes. Each class keeps an
//! intrusive Treiber stack of free blocks whose head is updated with
//! compare-and-swap. Freed blocks are kept for reuse for the allocator's
//! lifetime instead of going back to the system, which suits a process that
//! churns many same-sized transfer buffers.
//!
//! ```text
//!   ┌──────────────┬───────────────────────────────┐
//!   │ BlockHeader  │ user region (2^k bytes)       │
//!   │ next | size  │                               │
//!   └──────────────┴───────────────────────────────┘
//!                  ▲
//!                  └── pointer handed to the caller
//! ```

use super::{AllocError, BlockAllocator};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Number of size classes. Class `k` serves blocks of `2^k` bytes.
pub const CLASS_COUNT: usize = 32;

/// Largest request served from a size class (`2^31`).
pub const MAX_BLOCK_SIZE: usize = 1 << (CLASS_COUNT - 1);

/// Alignment of every header and therefore of every returned pointer.
pub const BLOCK_ALIGN: usize = 16;

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Marks blocks that bypass the free lists and go straight back to the
/// system on free.
const UNPOOLED: usize = 1 << (usize::BITS - 1);

#[cfg(target_pointer_width = "64")]
const ADDR_BITS: u32 = 48;
#[cfg(not(target_pointer_width = "64"))]
const ADDR_BITS: u32 = 32;

const ADDR_MASK: u64 = (1u64 << ADDR_BITS) - 1;
const TAG_MASK: u64 = !0u64 >> ADDR_BITS;

/// What to do with requests larger than [`MAX_BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OversizePolicy {
    /// Reject with [`AllocError::TooLarge`].
    #[default]
    Fail,
    /// Serve from the system allocator and return to it on free.
    System,
}

#[repr(C, align(16))]
struct BlockHeader {
    next: AtomicPtr<BlockHeader>,
    /// Capacity of the user region, possibly tagged with `UNPOOLED`.
    size: usize,
}

/// How a request of a given size is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Empty,
    Class(u32),
    System,
    Reject,
}

/// Free-list head packing a block address and a modification tag into one
/// word, so a pop that raced with pop-pop-push of the same block fails its
/// CAS instead of installing a stale `next`.
struct FreeList {
    head: AtomicU64,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    #[inline]
    fn pack(block: *mut BlockHeader, tag: u64) -> u64 {
        (block as usize as u64 & ADDR_MASK) | ((tag & TAG_MASK) << ADDR_BITS)
    }

    #[inline]
    fn unpack(word: u64) -> (*mut BlockHeader, u64) {
        ((word & ADDR_MASK) as usize as *mut BlockHeader, word >> ADDR_BITS)
    }

    fn pop(&self) -> Option<NonNull<BlockHeader>> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (block, tag) = Self::unpack(current);
            let block = NonNull::new(block)?;
            // SAFETY: blocks that ever reached a free list stay allocated until
            // the allocator is dropped, so the header is readable even if a
            // racing pop already took it. The tag rejects the stale `next`.
            let next = unsafe { block.as_ref().next.load(Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                current,
                Self::pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(block),
                Err(actual) => current = actual,
            }
        }
    }

    fn push(&self, block: NonNull<BlockHeader>) {
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (head, tag) = Self::unpack(current);
            // SAFETY: the caller owns `block` until the CAS publishes it.
            unsafe { block.as_ref().next.store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                current,
                Self::pack(block.as_ptr(), tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Detach the whole list. Only used on drop.
    fn take_all(&self) -> *mut BlockHeader {
        Self::unpack(self.head.swap(0, Ordering::AcqRel)).0
    }

    fn len(&self) -> usize {
        let (mut block, _) = Self::unpack(self.head.load(Ordering::Acquire));
        let mut count = 0;
        while !block.is_null() {
            count += 1;
            // SAFETY: see `pop`; list blocks are never released early.
            block = unsafe { (*block).next.load(Ordering::Relaxed) };
        }
        count
    }
}

/// Thread-safe, lock-free, size-classed block allocator.
///
/// Safe for concurrent use from any number of threads. Never calls back
/// into the global allocator (fresh blocks come from [`System`]), so it can
/// itself back `#[global_allocator]` through
/// [`PoolGlobalAlloc`](super::PoolGlobalAlloc).
pub struct SegregatedAllocator {
    classes: [FreeList; CLASS_COUNT],
    oversize: OversizePolicy,
    system_allocations: AtomicUsize,
}

// SAFETY: all shared state is atomic; blocks are handed out to one owner.
unsafe impl Send for SegregatedAllocator {}
unsafe impl Sync for SegregatedAllocator {}

impl Default for SegregatedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegregatedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegregatedAllocator")
            .field("oversize", &self.oversize)
            .field(
                "system_allocations",
                &self.system_allocations.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl SegregatedAllocator {
    pub const fn new() -> Self {
        Self::with_policy(OversizePolicy::Fail)
    }

    pub const fn with_policy(oversize: OversizePolicy) -> Self {
        const EMPTY: FreeList = FreeList::new();
        Self {
            classes: [EMPTY; CLASS_COUNT],
            oversize,
            system_allocations: AtomicUsize::new(0),
        }
    }

    pub fn oversize_policy(&self) -> OversizePolicy {
        self.oversize
    }

    /// Size class serving `size`, if any.
    pub fn class_for(size: usize) -> Option<u32> {
        if size == 0 || size > MAX_BLOCK_SIZE {
            return None;
        }
        Some(size.next_power_of_two().trailing_zeros())
    }

    pub(crate) fn route(&self, size: usize) -> Route {
        match Self::class_for(size) {
            Some(class) => Route::Class(class),
            None if size == 0 => Route::Empty,
            None => match self.oversize {
                OversizePolicy::Fail => Route::Reject,
                OversizePolicy::System => Route::System,
            },
        }
    }

    /// Number of blocks currently parked on the free list of `class`.
    ///
    /// Diagnostic only: the count is a snapshot and may be stale if other
    /// threads allocate or free concurrently.
    pub fn free_blocks(&self, class: u32) -> usize {
        self.classes
            .get(class as usize)
            .map(FreeList::len)
            .unwrap_or(0)
    }

    /// Blocks obtained from the system allocator so far.
    pub fn system_allocations(&self) -> usize {
        self.system_allocations.load(Ordering::Relaxed)
    }

    fn layout_for(capacity: usize) -> Result<Layout, AllocError> {
        let total = capacity
            .checked_add(HEADER_SIZE)
            .ok_or(AllocError::TooLarge { size: capacity })?;
        Layout::from_size_align(total, BLOCK_ALIGN).map_err(|_| AllocError::TooLarge { size: capacity })
    }

    /// Get a block with room for `capacity` bytes straight from the system.
    fn fresh_block(
        &self,
        capacity: usize,
        zeroed: bool,
        pooled: bool,
    ) -> Result<NonNull<BlockHeader>, AllocError> {
        let layout = Self::layout_for(capacity)?;
        // SAFETY: layout has non-zero size (header included).
        let raw = unsafe {
            if zeroed {
                System.alloc_zeroed(layout)
            } else {
                System.alloc(layout)
            }
        };
        let block = NonNull::new(raw.cast::<BlockHeader>()).ok_or(AllocError::OutOfMemory {
            size: capacity,
        })?;
        self.system_allocations.fetch_add(1, Ordering::Relaxed);

        // Addresses that do not fit the tagged head cannot be pooled.
        let fits = (raw as usize as u64) & !ADDR_MASK == 0;
        let size = if pooled && fits {
            capacity
        } else {
            capacity | UNPOOLED
        };
        // SAFETY: freshly allocated, aligned for BlockHeader.
        unsafe {
            block.as_ptr().write(BlockHeader {
                next: AtomicPtr::new(ptr::null_mut()),
                size,
            });
        }
        Ok(block)
    }

    #[inline]
    fn user_ptr(block: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: the user region directly follows the header in the same
        // allocation.
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// # Safety
    /// `ptr` must have been returned by this allocator and not yet freed.
    #[inline]
    unsafe fn header_of(ptr: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>())
    }

    fn allocate_impl(&self, size: usize, zeroed: bool) -> Result<Option<NonNull<u8>>, AllocError> {
        let class = match self.route(size) {
            Route::Empty => return Ok(None),
            Route::Reject => return Err(AllocError::TooLarge { size }),
            Route::System => {
                let block = self.fresh_block(size, zeroed, false)?;
                return Ok(Some(Self::user_ptr(block)));
            }
            Route::Class(class) => class,
        };

        let capacity = 1usize << class;
        let block = match self.classes[class as usize].pop() {
            Some(block) => {
                if zeroed {
                    // SAFETY: the user region of a class-k block is 2^k bytes.
                    unsafe { ptr::write_bytes(Self::user_ptr(block).as_ptr(), 0, capacity) };
                }
                block
            }
            None => self.fresh_block(capacity, zeroed, true)?,
        };
        Ok(Some(Self::user_ptr(block)))
    }

    /// Capacity of the block behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn capacity_of(&self, ptr: NonNull<u8>) -> usize {
        Self::header_of(ptr).as_ref().size & !UNPOOLED
    }
}

impl BlockAllocator for SegregatedAllocator {
    fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.allocate_impl(size, false)
    }

    fn allocate_zeroed(
        &self,
        count: usize,
        size_each: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let size = count.checked_mul(size_each).ok_or(AllocError::Overflow)?;
        self.allocate_impl(size, true)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size);
        };

        let old_capacity = self.capacity_of(ptr);
        if new_size <= old_capacity {
            return Ok(Some(ptr));
        }

        let Some(fresh) = self.allocate(new_size)? else {
            return Ok(Some(ptr));
        };
        ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_capacity);
        self.free(Some(ptr));
        Ok(Some(fresh))
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let block = Self::header_of(ptr);
        let size = block.as_ref().size;
        if size & UNPOOLED != 0 {
            let capacity = size & !UNPOOLED;
            if let Ok(layout) = Self::layout_for(capacity) {
                System.dealloc(block.as_ptr().cast::<u8>(), layout);
            }
            return;
        }
        let class = size.trailing_zeros() as usize;
        self.classes[class].push(block);
    }

    fn name(&self) -> &'static str {
        "segregated"
    }
}

impl Drop for SegregatedAllocator {
    fn drop(&mut self) {
        for (class, list) in self.classes.iter().enumerate() {
            let mut block = list.take_all();
            let Ok(layout) = Self::layout_for(1usize << class) else {
                continue;
            };
            while !block.is_null() {
                // SAFETY: exclusive access in drop; every listed block was
                // allocated with this class's layout.
                unsafe {
                    let next = (*block).next.load(Ordering::Relaxed);
                    System.dealloc(block.cast::<u8>(), layout);
                    block = next;
                }
            }
        }
    }
}
