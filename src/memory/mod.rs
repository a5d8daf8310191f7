//! Block allocators for engine and transfer memory.
//!
//! Provides the allocator seam the bridge hands to its transfer engine:
//! - [`BlockAllocator`]: malloc-style interface (allocate, zeroed allocate,
//!   reallocate, free, duplicate)
//! - [`SegregatedAllocator`]: lock-free power-of-two free lists, the default
//! - [`SystemAllocator`]: the C library heap
//! - [`PoolGlobalAlloc`]: a segregated allocator usable as
//!   `#[global_allocator]`
//! - [`BlockBuf`]: an owned byte buffer carved from any [`BlockAllocator`]

mod global;
mod segregated;

pub use global::PoolGlobalAlloc;
pub use segregated::{
    OversizePolicy, SegregatedAllocator, BLOCK_ALIGN, CLASS_COUNT, MAX_BLOCK_SIZE,
};

use std::ptr::{self, NonNull};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::base::neterror::NetError;

/// Allocation failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("Allocation of {size} bytes exceeds the largest size class")]
    TooLarge { size: usize },
    #[error("Allocation size overflowed")]
    Overflow,
    #[error("System allocator returned no memory for {size} bytes")]
    OutOfMemory { size: usize },
}

impl From<AllocError> for NetError {
    fn from(_: AllocError) -> Self {
        NetError::OutOfMemory
    }
}

/// A malloc-style block allocator.
///
/// Mirrors the five memory hooks a C transfer engine expects (malloc,
/// calloc, realloc, free, strdup). Zero-byte requests produce `Ok(None)`
/// rather than a dangling pointer. Implementations must be thread-safe: an
/// engine may call them from threads the bridge does not control.
pub trait BlockAllocator: Send + Sync {
    /// Allocate at least `size` bytes, aligned to [`BLOCK_ALIGN`].
    fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Allocate `count * size_each` zero-filled bytes.
    fn allocate_zeroed(
        &self,
        count: usize,
        size_each: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Grow or keep the block behind `ptr`. `None` behaves like [`allocate`].
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not have been freed. On
    /// success the old pointer must no longer be used unless it was returned.
    ///
    /// [`allocate`]: BlockAllocator::allocate
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Release a block. `None` is a no-op.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not have been freed.
    unsafe fn free(&self, ptr: Option<NonNull<u8>>);

    /// Copy `bytes` into a fresh block followed by a NUL terminator.
    fn duplicate(&self, bytes: &[u8]) -> Result<NonNull<u8>, AllocError> {
        let size = bytes.len().checked_add(1).ok_or(AllocError::Overflow)?;
        let block = self
            .allocate(size)?
            .ok_or(AllocError::OutOfMemory { size })?;
        // SAFETY: block holds at least `size` bytes and does not overlap `bytes`.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), block.as_ptr(), bytes.len());
            block.as_ptr().add(bytes.len()).write(0);
        }
        Ok(block)
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

impl<A: BlockAllocator + ?Sized> BlockAllocator for Arc<A> {
    fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        (**self).allocate(size)
    }

    fn allocate_zeroed(
        &self,
        count: usize,
        size_each: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        (**self).allocate_zeroed(count, size_each)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        (**self).reallocate(ptr, new_size)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        (**self).free(ptr)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// The C library heap (`malloc` and friends).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl BlockAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        // SAFETY: plain malloc call.
        let raw = unsafe { libc::malloc(size) };
        NonNull::new(raw.cast::<u8>())
            .map(Some)
            .ok_or(AllocError::OutOfMemory { size })
    }

    fn allocate_zeroed(
        &self,
        count: usize,
        size_each: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let size = count.checked_mul(size_each).ok_or(AllocError::Overflow)?;
        if size == 0 {
            return Ok(None);
        }
        // SAFETY: plain calloc call; overflow already ruled out.
        let raw = unsafe { libc::calloc(count, size_each) };
        NonNull::new(raw.cast::<u8>())
            .map(Some)
            .ok_or(AllocError::OutOfMemory { size })
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            return Ok(Some(ptr));
        }
        let raw = libc::realloc(ptr.as_ptr().cast(), new_size);
        NonNull::new(raw.cast::<u8>())
            .map(Some)
            .ok_or(AllocError::OutOfMemory { size: new_size })
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        if let Some(ptr) = ptr {
            libc::free(ptr.as_ptr().cast());
        }
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Process-wide segregated allocator used when a bridge is created without
/// an explicit allocator.
pub fn default_allocator() -> Arc<dyn BlockAllocator> {
    static DEFAULT: LazyLock<Arc<SegregatedAllocator>> =
        LazyLock::new(|| Arc::new(SegregatedAllocator::new()));
    Arc::clone(&*DEFAULT) as Arc<dyn BlockAllocator>
}

/// Smallest block a growing [`BlockBuf`] asks for.
const MIN_GROWTH: usize = 64;

/// An owned byte buffer backed by a [`BlockAllocator`].
///
/// Grows through [`BlockAllocator::reallocate`]; the block goes back to its
/// allocator on drop.
pub struct BlockBuf {
    allocator: Arc<dyn BlockAllocator>,
    ptr: Option<NonNull<u8>>,
    len: usize,
    capacity: usize,
}

// SAFETY: the buffer exclusively owns its block and the allocator is Sync.
unsafe impl Send for BlockBuf {}

impl BlockBuf {
    /// An empty buffer; nothing is allocated until the first append.
    pub fn empty(allocator: Arc<dyn BlockAllocator>) -> Self {
        Self {
            allocator,
            ptr: None,
            len: 0,
            capacity: 0,
        }
    }

    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(allocator: Arc<dyn BlockAllocator>, len: usize) -> Result<Self, AllocError> {
        let ptr = allocator.allocate_zeroed(1, len)?;
        Ok(Self {
            allocator,
            ptr,
            len,
            capacity: len,
        })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn copy_from(allocator: Arc<dyn BlockAllocator>, bytes: &[u8]) -> Result<Self, AllocError> {
        let ptr = allocator.allocate(bytes.len())?;
        if let Some(ptr) = ptr {
            // SAFETY: the block holds at least `bytes.len()` bytes.
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        }
        Ok(Self {
            allocator,
            ptr,
            len: bytes.len(),
            capacity: bytes.len(),
        })
    }

    /// Append `bytes`, growing the block at least geometrically. On failure
    /// the buffer is left as it was.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), AllocError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let needed = self
            .len
            .checked_add(bytes.len())
            .ok_or(AllocError::Overflow)?;
        if needed > self.capacity {
            let target = needed
                .max(self.capacity.saturating_mul(2))
                .max(MIN_GROWTH);
            // SAFETY: `ptr` came from `self.allocator` and is still live.
            let grown = unsafe { self.allocator.reallocate(self.ptr, target)? };
            self.ptr = Some(grown.ok_or(AllocError::OutOfMemory { size: target })?);
            self.capacity = target;
        }
        if let Some(ptr) = self.ptr {
            // SAFETY: the block holds `capacity >= needed` bytes.
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(self.len), bytes.len())
            };
        }
        self.len = needed;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the underlying block, if any.
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }
}

impl std::ops::Deref for BlockBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: `len` bytes were allocated and initialized at construction.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl std::ops::DerefMut for BlockBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: as in `deref`, and `&mut self` guarantees exclusivity.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl Drop for BlockBuf {
    fn drop(&mut self) {
        // SAFETY: the block came from `self.allocator` and is released once.
        unsafe { self.allocator.free(self.ptr.take()) };
    }
}

impl std::fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuf")
            .field("allocator", &self.allocator.name())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
