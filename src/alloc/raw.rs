//! The general-purpose allocator underneath the randomizer.

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

/// A `malloc()`/`free()` pair: size in, address out, address back in.
///
/// # Safety
///
/// - Non-null blocks returned by `malloc(size)` must be valid for reads and
///   writes of `size` bytes and aligned to at least
///   `2^BASELINE_ALIGN_BITS`.
/// - `free()` must accept any such block, from any thread.
pub unsafe trait RawAlloc {
    /// Alignment every block is guaranteed to have, as a power of two
    const BASELINE_ALIGN_BITS: u32;

    /// Allocate `size` bytes, null on failure. `size` is never zero when
    /// called by the randomizer.
    fn malloc(&self, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `block` must come from `self.malloc()` and not have been freed yet.
    unsafe fn free(&self, block: *mut u8);

    /// How many bytes `block` really holds, if the allocator can tell.
    /// Never less than what was asked of `malloc()`.
    ///
    /// # Safety
    ///
    /// `block` must come from `self.malloc()` and not have been freed yet.
    unsafe fn usable_size(&self, block: *mut u8) -> Option<usize> {
        let _ = block;
        None
    }
}

/// The C library's `malloc()`.
///
/// We only count on natural pointer alignment here: it is the weakest
/// guarantee any libc gives, and underestimating the baseline only costs a
/// few bytes of reserve.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcMalloc;

// SAFETY: `malloc()` returns blocks suitably aligned for any fundamental
// type, which includes `usize`, and `free()` is thread-safe
unsafe impl RawAlloc for LibcMalloc {
    const BASELINE_ALIGN_BITS: u32 = mem::align_of::<usize>().trailing_zeros();

    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: `malloc()` has no preconditions
        unsafe { libc::malloc(size) }.cast()
    }

    unsafe fn free(&self, block: *mut u8) {
        // SAFETY: same contract as the caller's
        unsafe { libc::free(block.cast()) }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn usable_size(&self, block: *mut u8) -> Option<usize> {
        // SAFETY: `block` is a live `malloc()` block
        Some(unsafe { libc::malloc_usable_size(block.cast()) })
    }

    #[cfg(target_vendor = "apple")]
    unsafe fn usable_size(&self, block: *mut u8) -> Option<usize> {
        // SAFETY: `block` is a live `malloc()` block
        Some(unsafe { libc::malloc_size(block.cast_const().cast()) })
    }
}

/// How many blocks went through a [`CountingAlloc`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Successful `malloc()` calls
    pub allocated: usize,
    /// `free()` calls
    pub freed: usize,
    /// `malloc()` calls that returned null
    pub failed: usize,
    /// Sum of all sizes passed to successful `malloc()` calls
    pub bytes_requested: usize,
}

impl Stats {
    /// Blocks allocated and not yet freed
    pub fn live(&self) -> usize {
        self.allocated.wrapping_sub(self.freed)
    }
}

/// Wraps another [`RawAlloc`] and keeps count of what passes through it, so
/// leaks and double frees show up as `live() != 0`.
#[derive(Debug, Default)]
pub struct CountingAlloc<A> {
    inner: A,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    failed: AtomicUsize,
    bytes_requested: AtomicUsize,
}

impl<A> CountingAlloc<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes_requested: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            allocated: self.allocated.load(Ordering::Acquire),
            freed: self.freed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            bytes_requested: self.bytes_requested.load(Ordering::Acquire),
        }
    }
}

// SAFETY: forwards to `A`, which upholds the contract
unsafe impl<A> RawAlloc for CountingAlloc<A>
where
    A: RawAlloc,
{
    const BASELINE_ALIGN_BITS: u32 = A::BASELINE_ALIGN_BITS;

    fn malloc(&self, size: usize) -> *mut u8 {
        let block = self.inner.malloc(size);
        if block.is_null() {
            self.failed.fetch_add(1, Ordering::Release);
        } else {
            self.allocated.fetch_add(1, Ordering::Release);
            self.bytes_requested.fetch_add(size, Ordering::Release);
        }
        block
    }

    unsafe fn free(&self, block: *mut u8) {
        self.freed.fetch_add(1, Ordering::Release);
        // SAFETY: same contract as the caller's
        unsafe { self.inner.free(block) }
    }

    unsafe fn usable_size(&self, block: *mut u8) -> Option<usize> {
        // SAFETY: same contract as the caller's
        unsafe { self.inner.usable_size(block) }
    }
}
