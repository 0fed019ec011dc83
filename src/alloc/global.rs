//! The process-wide randomizer and its `malloc()`-style entry points.
//!
//! [`RANDOMIZER`] reads its configuration from the environment the first
//! time any of these functions runs. Tests that want a specific setup
//! typically call the setters once, before spawning any allocating threads:
//!
//! ```
//! use alloc_randomizer::{allocate, deallocate, set_align_bits, set_random_bits};
//!
//! set_align_bits(6);
//! set_random_bits(2);
//! let p = allocate(40).unwrap();
//! assert_eq!(p.as_ptr() as usize % 64, 0);
//! unsafe { deallocate(p.as_ptr()) };
//! ```

use std::ptr::NonNull;

use crate::config::Config;

use super::{
    randomizer::{AllocError, Randomizer},
    raw::LibcMalloc,
};

pub static RANDOMIZER: Randomizer<LibcMalloc> = Randomizer::from_env(LibcMalloc);

/// [`Randomizer::allocate()`] on [`RANDOMIZER`]
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    RANDOMIZER.allocate(size)
}

/// [`Randomizer::deallocate()`] on [`RANDOMIZER`]
///
/// # Safety
///
/// `ptr` must be null or come from [`allocate()`] and not have been
/// deallocated since.
pub unsafe fn deallocate(ptr: *mut u8) {
    // SAFETY: same contract as the caller's
    unsafe { RANDOMIZER.deallocate(ptr) }
}

/// [`Randomizer::allocate_zeroed()`] on [`RANDOMIZER`]
pub fn allocate_zeroed(size: usize) -> Result<NonNull<u8>, AllocError> {
    RANDOMIZER.allocate_zeroed(size)
}

/// `realloc()` for pointers from [`allocate()`]. The old contents up to the
/// end of the old block are carried over, since the requested size is not
/// recorded anywhere.
///
/// Fails, leaving `ptr` alone, when the C library cannot report block sizes
/// on this target.
///
/// # Safety
///
/// `ptr` must be null or come from [`allocate()`] and not have been
/// deallocated since. On success it is deallocated.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
    if ptr.is_null() {
        return allocate(new_size);
    }
    // SAFETY: same contract as the caller's
    let Some(old_size) = (unsafe { RANDOMIZER.usable_size(ptr) }) else {
        return Err(AllocError { size: new_size });
    };
    // SAFETY: `old_size` bytes from `ptr` to the end of its block are ours
    unsafe { RANDOMIZER.reallocate(ptr, old_size, new_size) }
}

/// See [`Config::set_align_bits()`]. Not meant to race with allocations.
pub fn set_align_bits(bits: u32) {
    RANDOMIZER.config().set_align_bits(bits);
}

/// See [`Config::set_random_bits()`]. Not meant to race with allocations.
pub fn set_random_bits(bits: u32) {
    RANDOMIZER.config().set_random_bits(bits);
}

/// Reserve needed for the configured alignment on top of an allocator that
/// guarantees `2^baseline_bits`, see
/// [`reserve_for()`](super::reserve::reserve_for)
pub fn calculate_reserve(baseline_bits: u32) -> usize {
    RANDOMIZER.calculate_reserve(baseline_bits)
}

pub fn config() -> &'static Config {
    RANDOMIZER.config()
}

/// Held by every unit test that changes the global configuration
#[cfg(test)]
pub(crate) static CONFIG_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
