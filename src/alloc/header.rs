//! The word stored immediately behind every pointer we hand out.
//!
//! ```plaintext
//! block               user - HEADER_SIZE   user
//! |                     |                    |
//! v                     v                    v
//! +---------------------+--------------------+----------------+-----------+
//! | slack (random)      | BlockHeader        | requested size | slack     |
//! +---------------------+--------------------+----------------+-----------+
//! ```
//!
//! The user pointer is only as aligned as the configuration asks for, which
//! may be a single byte, so the header is always accessed unaligned.

use std::mem;

/// Bookkeeping for one live allocation: where the underlying block starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    block: *mut u8,
}

/// Bytes occupied by a [`BlockHeader`], one pointer
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// `log2(HEADER_SIZE)`
pub const HEADER_BITS: u32 = HEADER_SIZE.trailing_zeros();

impl BlockHeader {
    pub const fn new(block: *mut u8) -> Self {
        Self { block }
    }

    /// The address the underlying allocator originally returned
    pub const fn block(self) -> *mut u8 {
        self.block
    }

    /// Store this header in the `HEADER_SIZE` bytes right before `user`.
    ///
    /// # Safety
    ///
    /// `[user - HEADER_SIZE, user)` must be valid for writes and belong to
    /// the block this header describes.
    pub unsafe fn write_behind(self, user: *mut u8) {
        // SAFETY: caller guarantees the bytes behind `user` are ours, and the
        // unaligned write imposes no alignment requirement on them
        unsafe { user.sub(HEADER_SIZE).cast::<BlockHeader>().write_unaligned(self) }
    }

    /// Recover the header stored behind `user`.
    ///
    /// # Safety
    ///
    /// `user` must have been returned by an allocation wrapper that wrote a
    /// header with [`BlockHeader::write_behind()`], and must not have been
    /// released since. Passing anything else (a foreign pointer, a pointer
    /// that was already deallocated) is undefined behaviour, exactly like
    /// handing such a pointer to `free(3)`.
    pub unsafe fn read_behind(user: *const u8) -> Self {
        // SAFETY: see above
        unsafe { user.sub(HEADER_SIZE).cast::<BlockHeader>().read_unaligned() }
    }
}
