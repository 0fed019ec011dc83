//! C entry points for the process-wide randomizer.
//!
//! These are deliberately *not* called `malloc` and friends: interposing the
//! C library's symbols is a matter of how the shim is injected into a
//! process, and the randomizer itself is layered on top of `malloc()`.
//!
//! Pointers from `arand_malloc()`, `arand_calloc()` and `arand_realloc()`
//! point past a hidden header into a larger block. Hand them to
//! `arand_realloc()`/`arand_free()` only, never to the C library's own
//! `realloc()`/`free()`.

use std::ptr;

use libc::{c_uint, c_void, size_t};

use crate::alloc::global;

/// `malloc()` through the randomizer. Null when out of memory.
#[no_mangle]
pub extern "C" fn arand_malloc(size: size_t) -> *mut c_void {
    match global::allocate(size) {
        Ok(data) => data.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// `calloc()` through the randomizer. Null when out of memory or when
/// `count * size` overflows.
#[no_mangle]
pub extern "C" fn arand_calloc(count: size_t, size: size_t) -> *mut c_void {
    let Some(total) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    match global::allocate_zeroed(total) {
        Ok(data) => data.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// `realloc()` through the randomizer. The block always moves. Null when it
/// fails, in which case `ptr` is still valid.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from one of the `arand_*`
/// allocation functions. On success it must not be used again.
#[no_mangle]
pub unsafe extern "C" fn arand_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    // SAFETY: same contract as the caller's
    match unsafe { global::reallocate(ptr.cast(), size) } {
        Ok(data) => data.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// `free()` through the randomizer. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or come from `arand_malloc()` and not have been freed
/// since.
#[no_mangle]
pub unsafe extern "C" fn arand_free(ptr: *mut c_void) {
    // SAFETY: same contract as the caller's
    unsafe { global::deallocate(ptr.cast()) }
}

/// Aborts the process if `bits` is out of range.
#[no_mangle]
pub extern "C" fn arand_set_align_bits(bits: c_uint) {
    global::set_align_bits(bits);
}

/// Aborts the process if `bits` is out of range.
#[no_mangle]
pub extern "C" fn arand_set_random_bits(bits: c_uint) {
    global::set_random_bits(bits);
}

#[no_mangle]
pub extern "C" fn arand_calculate_reserve(baseline_bits: c_uint) -> size_t {
    global::calculate_reserve(baseline_bits)
}
