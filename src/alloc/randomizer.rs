//! The allocation and deallocation wrappers.
//!
//! [`Randomizer`] sits on top of a [`RawAlloc`] and perturbs *where* inside
//! each underlying block the caller's pointer lands:
//!
//! 1. Ask the underlying allocator for `size + reserve` bytes, where the
//!    reserve is computed fresh from the current [`Config`] (see
//!    [`placement_reserve()`]).
//! 2. Find the first `2^align_bits` aligned address that leaves room for a
//!    [`BlockHeader`] behind it.
//! 3. Slide forward by a random multiple of `2^align_bits`, drawn with
//!    `random_bits` bits of entropy.
//! 4. Store the block address in the header and hand out the pointer.
//!
//! Deallocation reads the header back and frees the block it names.
//!
//! Code that quietly depends on the layout of heap memory (blocks being
//! 16-byte aligned, two consecutive allocations being adjacent, a field
//! living at a fixed distance from a chunk boundary) will start failing
//! under a randomizer with a bit of alignment and entropy configured.

use std::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{Config, MAX_BITS},
    lazy_lock::{LazyLock, LazyLockState},
    putln,
    serialize::serde_usize,
    util::{
        hint::cold,
        num::{align_bits_of, round_up_pow2},
    },
};

use super::{
    header::{BlockHeader, HEADER_SIZE},
    raw::RawAlloc,
    reserve::{placement_reserve, reserve_for},
};

/// Used while the real config is still being built by this very thread
static FALLBACK_CONFIG: Config = Config::new();

/// The underlying allocator could not provide `size` bytes plus reserve
/// (or the total did not even fit in a `usize`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out of memory allocating {size} bytes")]
pub struct AllocError {
    pub size: usize,
}

/// Where one allocation ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// What the underlying allocator returned
    #[serde(with = "serde_usize")]
    pub block: *mut u8,
    /// What the caller gets
    #[serde(with = "serde_usize")]
    pub user: *mut u8,
    /// Bytes the caller asked for
    pub size: usize,
    /// Bytes requested on top of `size`
    pub reserve: usize,
    /// Alignment the user pointer satisfies
    pub align_bits: u32,
}

impl Placement {
    /// Distance of the user pointer from the start of the block
    pub fn offset(&self) -> usize {
        self.user as usize - self.block as usize
    }

    /// Size of the underlying block
    pub fn block_size(&self) -> usize {
        self.size + self.reserve
    }
}

/// A placement-randomizing layer over the allocator `A`.
///
/// `Randomizer` is usable both directly ([`Randomizer::allocate()`] and
/// [`Randomizer::deallocate()`], `malloc()`-style, no layout needed on
/// release) and as a `#[global_allocator]`:
///
/// ```no_run
/// use alloc_randomizer::{LibcMalloc, Randomizer};
///
/// #[global_allocator]
/// static GLOBAL: Randomizer<LibcMalloc> = Randomizer::from_env(LibcMalloc);
/// ```
///
/// The configuration is built lazily, exactly once, on the first call into
/// any entry point, however many threads make that call at the same time.
pub struct Randomizer<A> {
    allocator: A,
    config: LazyLock<Config>,
}

impl<A> Randomizer<A> {
    /// A randomizer with the default [`Config`]: no extra alignment, no
    /// randomization. Tune it through [`Randomizer::config()`].
    pub const fn new(allocator: A) -> Self {
        Self::with_init(allocator, Config::new)
    }

    /// A randomizer configured from `ALLOC_RANDOMIZER_*` environment
    /// variables on first use.
    pub const fn from_env(allocator: A) -> Self {
        Self::with_init(allocator, Config::from_env_or_default)
    }

    /// A randomizer whose config is built by `init` on first use
    pub const fn with_init(allocator: A, init: fn() -> Config) -> Self {
        Self {
            allocator,
            config: LazyLock::new(init),
        }
    }

    /// Return the underlying allocator
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The live configuration, initializing it if needed. Changing it while
    /// other threads allocate is allowed but racy, see [`Config`].
    pub fn config(&self) -> &Config {
        self.config.initialize()
    }

    /// Whether the configuration has been built yet. Any call into the
    /// randomizer builds it, including `deallocate(null)`.
    pub fn is_initialized(&self) -> bool {
        LazyLock::state(&self.config) == LazyLockState::Init
    }

    /// Like `config()`, but never blocks on our own initializer: an
    /// allocation made while building the config gets the defaults.
    fn current_config(&self) -> &Config {
        self.config.try_initialize().unwrap_or(&FALLBACK_CONFIG)
    }
}

impl<A> Randomizer<A>
where
    A: RawAlloc,
{
    /// [`reserve_for()`] with the currently configured alignment
    pub fn calculate_reserve(&self, baseline_bits: u32) -> usize {
        reserve_for(self.current_config().align_bits(), baseline_bits)
    }

    /// Allocate `size` bytes, aligned as configured. `size == 0` still gets
    /// a distinct pointer that must be passed to `deallocate()`.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_aligned(size, 0)
    }

    /// Allocate `size` bytes aligned to at least `2^align_bits`, or to the
    /// configured alignment if that is stronger.
    ///
    /// # Panics
    ///
    /// If `align_bits > MAX_BITS`
    pub fn allocate_aligned(&self, size: usize, align_bits: u32) -> Result<NonNull<u8>, AllocError> {
        let placement = self.place(size, align_bits)?;
        // SAFETY: `user` lies inside a block the underlying allocator
        // returned, which is non-null
        Ok(unsafe { NonNull::new_unchecked(placement.user) })
    }

    /// Allocate, and report exactly where the allocation went. The returned
    /// `placement.user` is released with `deallocate()` like any other.
    ///
    /// # Panics
    ///
    /// If `align_bits > MAX_BITS`
    pub fn place(&self, size: usize, align_bits: u32) -> Result<Placement, AllocError> {
        assert!(
            align_bits <= MAX_BITS,
            "align_bits = {align_bits} is more than the maximum of {MAX_BITS}"
        );
        let config = self.current_config();
        let align_bits = cmp::max(config.align_bits(), align_bits);
        let random_bits = config.random_bits();

        let Some((reserve, total)) = placement_reserve(align_bits, random_bits, A::BASELINE_ALIGN_BITS)
            .and_then(|reserve| Some((reserve, size.checked_add(reserve)?)))
        else {
            return cold(|| Err(AllocError { size }));
        };

        let block = self.allocator.malloc(total);
        if block.is_null() {
            return cold(|| {
                if config.trace() {
                    putln!("alloc(size: ", size, ", reserve: ", reserve, ") failed");
                }
                Err(AllocError { size })
            });
        }

        let align = 1usize << align_bits;
        let first = round_up_pow2(block as usize + HEADER_SIZE, align) - block as usize;
        let offset = first + (config.entropy().draw(random_bits) << align_bits);
        debug_assert!(offset >= HEADER_SIZE && offset <= reserve);

        // SAFETY: `HEADER_SIZE <= offset <= reserve`, so both the header at
        // `user - HEADER_SIZE` and the `size` bytes at `user` lie inside the
        // `size + reserve` byte block
        let user = unsafe { block.add(offset) };
        unsafe { BlockHeader::new(block).write_behind(user) };

        if config.trace() {
            putln!(
                "alloc(size: ", size,
                ", align_bits: ", align_bits,
                ", reserve: ", reserve,
                ") block = ", block,
                ", user = ", user
            );
        }

        Ok(Placement {
            block,
            user,
            size,
            reserve,
            align_bits,
        })
    }

    /// Release a pointer returned by this randomizer. Null is a no-op, which
    /// also makes `deallocate(null)` a cheap way to force initialization.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from `allocate()`,
    /// `allocate_aligned()` or `place()` on this same randomizer, and not
    /// have been deallocated yet. Foreign pointers and double frees are
    /// undefined behaviour and are not detected, just as with `free(3)`.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let config = self.current_config();
        if ptr.is_null() {
            return;
        }
        // SAFETY: caller guarantees `ptr` is a live pointer of ours, so a
        // header sits right behind it
        let header = unsafe { BlockHeader::read_behind(ptr) };
        if config.trace() {
            putln!("dealloc(user = ", ptr, ") block = ", header.block());
        }
        // SAFETY: the header holds the block `malloc()` returned for `ptr`,
        // which has not been freed since
        unsafe { self.allocator.free(header.block()) }
    }

    /// [`Randomizer::allocate()`], with the `size` bytes zeroed
    pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let data = self.allocate(size)?;
        // SAFETY: `size` bytes at `data` were just allocated for us
        unsafe { data.as_ptr().write_bytes(0, size) };
        Ok(data)
    }

    /// Bytes usable at `ptr`, up to the end of its block, if the underlying
    /// allocator can tell its block sizes.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and have come from this randomizer.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        // SAFETY: caller guarantees a header sits behind `ptr`
        let block = unsafe { BlockHeader::read_behind(ptr) }.block();
        // SAFETY: the header names the live block holding `ptr`
        let block_size = unsafe { self.allocator.usable_size(block) }?;
        Some(block_size - (ptr as usize - block as usize))
    }

    /// Move an allocation into a fresh placement of `new_size` bytes,
    /// keeping its first `min(old_size, new_size)` bytes. A null `ptr` is a
    /// plain allocation. The block always moves, so a caller holding on to
    /// the old pointer is caught early. On failure `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or live from this randomizer with at least
    /// `old_size` readable bytes. On success it is deallocated.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let fresh = self.allocate(new_size)?;
        if !ptr.is_null() {
            // SAFETY: `ptr` holds `old_size` bytes, `fresh` holds `new_size`,
            // and the two are distinct allocations
            unsafe {
                ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), cmp::min(old_size, new_size));
                self.deallocate(ptr);
            }
        }
        Ok(fresh)
    }
}

unsafe impl<A> GlobalAlloc for Randomizer<A>
where
    A: RawAlloc,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align_bits = align_bits_of(layout.align());
        if align_bits > MAX_BITS {
            return ptr::null_mut();
        }
        match self.place(layout.size(), align_bits) {
            Ok(placement) => placement.user,
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        // SAFETY: the `GlobalAlloc` contract says `ptr` came from `alloc()`
        // on this allocator, which always goes through `place()`
        unsafe { self.deallocate(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;
    use crate::{
        alloc::raw::{CountingAlloc, LibcMalloc},
        util::assert::{aligned_to_bits, contained_in},
    };

    /// Remembers the size of every live block, so tests can check that user
    /// pointers stay inside them.
    #[derive(Default)]
    struct RecordingAlloc {
        blocks: Mutex<Vec<(usize, usize)>>,
    }

    impl RecordingAlloc {
        fn block_size(&self, block: *mut u8) -> usize {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .iter()
                .find(|(addr, _)| *addr == block as usize)
                .map(|&(_, size)| size)
                .expect("block is live")
        }
    }

    unsafe impl RawAlloc for RecordingAlloc {
        const BASELINE_ALIGN_BITS: u32 = LibcMalloc::BASELINE_ALIGN_BITS;

        fn malloc(&self, size: usize) -> *mut u8 {
            let block = LibcMalloc.malloc(size);
            self.blocks.lock().unwrap().push((block as usize, size));
            block
        }

        unsafe fn free(&self, block: *mut u8) {
            let mut blocks = self.blocks.lock().unwrap();
            let index = blocks
                .iter()
                .position(|(addr, _)| *addr == block as usize)
                .expect("freeing a block that is not live");
            blocks.swap_remove(index);
            unsafe { LibcMalloc.free(block) }
        }

        unsafe fn usable_size(&self, block: *mut u8) -> Option<usize> {
            Some(self.block_size(block))
        }
    }

    /// Always out of memory
    struct ExhaustedAlloc;

    unsafe impl RawAlloc for ExhaustedAlloc {
        const BASELINE_ALIGN_BITS: u32 = 4;

        fn malloc(&self, _: usize) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn free(&self, _: *mut u8) {
            unreachable!("nothing was ever allocated")
        }
    }

    fn randomizer<A>(allocator: A, align_bits: u32, random_bits: u32) -> Randomizer<A> {
        let randomizer = Randomizer::new(allocator);
        randomizer.config().set_align_bits(align_bits);
        randomizer.config().set_random_bits(random_bits);
        randomizer
    }

    #[test]
    fn pointers_honour_alignment_and_stay_in_their_block() {
        for align_bits in 0..=12 {
            for random_bits in 0..=4 {
                let r = randomizer(RecordingAlloc::default(), align_bits, random_bits);
                for size in [0, 1, 7, 8, 9, 63, 100, 4096] {
                    let p = r.place(size, 0).unwrap();
                    assert!(aligned_to_bits(p.user, align_bits));
                    assert!(p.offset() >= HEADER_SIZE);
                    let block_size = r.allocator().block_size(p.block);
                    assert_eq!(block_size, p.block_size());
                    assert!(contained_in(
                        p.user as usize - HEADER_SIZE,
                        HEADER_SIZE + size,
                        p.block as usize,
                        block_size,
                    ));
                    // SAFETY: `size` bytes at `user` belong to us
                    unsafe {
                        p.user.write_bytes(0x5a, size);
                        r.deallocate(p.user);
                    }
                }
                assert!(r.allocator().blocks.lock().unwrap().is_empty());
            }
        }
    }

    #[test]
    fn default_config_places_right_after_the_header() {
        let r = Randomizer::new(LibcMalloc);
        for size in [0, 1, 24, 1000] {
            let p = r.place(size, 0).unwrap();
            assert_eq!(p.offset(), HEADER_SIZE);
            assert_eq!(p.reserve, HEADER_SIZE);
            unsafe { r.deallocate(p.user) };
        }
    }

    #[test]
    fn offsets_are_randomized() {
        let r = randomizer(LibcMalloc, 4, 4);
        let mut offsets = HashSet::new();
        for _ in 0..200 {
            let p = r.place(32, 0).unwrap();
            offsets.insert(p.offset());
            unsafe { r.deallocate(p.user) };
        }
        assert!(offsets.len() > 2, "offsets never changed: {offsets:?}");
    }

    fn seeded() -> Config {
        let config = Config::with_seed(0);
        config.set_random_bits(10);
        config
    }

    fn offsets<A: RawAlloc>(r: &Randomizer<A>, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| {
                let p = r.place(8, 0).unwrap();
                unsafe { r.deallocate(p.user) };
                p.offset()
            })
            .collect()
    }

    #[test]
    fn same_seed_gives_same_offsets() {
        let left = Randomizer::with_init(LibcMalloc, seeded);
        let right = Randomizer::with_init(LibcMalloc, seeded);
        assert_eq!(offsets(&left, 16), offsets(&right, 16));

        let left = Randomizer::with_init(LibcMalloc, seeded);
        let right = Randomizer::with_init(LibcMalloc, seeded);
        let (mut from_left, mut from_right) = (Vec::new(), Vec::new());
        for _ in 0..16 {
            from_left.extend(offsets(&left, 1));
            from_right.extend(offsets(&right, 1));
        }
        assert_eq!(from_left, from_right);
    }

    #[test]
    fn seed_changes_offsets() {
        fn other_seed() -> Config {
            let config = Config::with_seed(1);
            config.set_random_bits(10);
            config
        }
        let left = Randomizer::with_init(LibcMalloc, seeded);
        let right = Randomizer::with_init(LibcMalloc, other_seed);
        assert_ne!(offsets(&left, 16), offsets(&right, 16));
    }

    #[test]
    fn tracing_does_not_change_results() {
        let r = randomizer(CountingAlloc::new(LibcMalloc), 4, 2);
        r.config().set_trace(true);
        let p = r.place(40, 0).unwrap();
        assert!(aligned_to_bits(p.user, 4));
        unsafe { r.deallocate(p.user) };
        unsafe { r.deallocate(ptr::null_mut()) };
        assert_eq!(r.allocator().stats().live(), 0);

        let r = randomizer(ExhaustedAlloc, 6, 2);
        r.config().set_trace(true);
        assert_eq!(r.allocate(128), Err(AllocError { size: 128 }));
    }

    #[test]
    fn zeroed_allocations_are_zeroed() {
        let r = randomizer(LibcMalloc, 3, 3);
        for size in [0, 1, 100, 1000] {
            let p = r.allocate_zeroed(size).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == 0));
            unsafe { r.deallocate(p.as_ptr()) };
        }
    }

    #[test]
    fn usable_size_reaches_the_end_of_the_block() {
        let r = randomizer(RecordingAlloc::default(), 5, 2);
        let p = r.place(20, 0).unwrap();
        let usable = unsafe { r.usable_size(p.user) }.unwrap();
        assert_eq!(usable, p.block_size() - p.offset());
        assert!(usable >= 20);
        unsafe { r.deallocate(p.user) };
    }

    #[test]
    fn reallocate_moves_and_keeps_the_prefix() {
        let r = randomizer(RecordingAlloc::default(), 4, 3);
        let p = r.allocate(16).unwrap();
        unsafe {
            for i in 0..16 {
                p.as_ptr().add(i).write(i as u8);
            }
            let grown = r.reallocate(p.as_ptr(), 16, 64).unwrap();
            assert_ne!(grown, p);
            assert!(aligned_to_bits(grown.as_ptr(), 4));
            let bytes = std::slice::from_raw_parts(grown.as_ptr(), 16);
            assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));

            let shrunk = r.reallocate(grown.as_ptr(), 64, 4).unwrap();
            assert_eq!(std::slice::from_raw_parts(shrunk.as_ptr(), 4), &[0, 1, 2, 3]);
            r.deallocate(shrunk.as_ptr());

            let fresh = r.reallocate(ptr::null_mut(), 0, 8).unwrap();
            r.deallocate(fresh.as_ptr());
        }
        assert!(r.allocator().blocks.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_reallocate_keeps_the_old_pointer() {
        let r = randomizer(CountingAlloc::new(LibcMalloc), 0, 0);
        let p = r.allocate(8).unwrap();
        unsafe {
            assert!(r.reallocate(p.as_ptr(), 8, usize::MAX).is_err());
            p.as_ptr().write_bytes(1, 8);
            r.deallocate(p.as_ptr());
        }
        assert_eq!(r.allocator().stats().live(), 0);
    }

    #[test]
    fn zero_sized_allocations_are_distinct_and_freeable() {
        let r = Randomizer::new(CountingAlloc::new(LibcMalloc));
        let a = r.allocate(0).unwrap();
        let b = r.allocate(0).unwrap();
        assert_ne!(a, b);
        unsafe {
            r.deallocate(a.as_ptr());
            r.deallocate(b.as_ptr());
        }
        let stats = r.allocator().stats();
        assert_eq!((stats.allocated, stats.freed), (2, 2));
    }

    #[test]
    fn deallocating_null_releases_nothing_but_initializes() {
        let r = Randomizer::new(CountingAlloc::new(LibcMalloc));
        assert!(!r.is_initialized());
        unsafe { r.deallocate(ptr::null_mut()) };
        assert!(r.is_initialized());
        assert_eq!(r.allocator().stats(), Default::default());
    }

    #[test]
    fn out_of_memory_is_reported_not_panicked() {
        let r = randomizer(ExhaustedAlloc, 6, 2);
        assert_eq!(r.allocate(128), Err(AllocError { size: 128 }));
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let r = Randomizer::new(CountingAlloc::new(LibcMalloc));
        assert_eq!(r.allocate(usize::MAX), Err(AllocError { size: usize::MAX }));
        assert_eq!(r.allocator().stats().allocated, 0);
    }

    #[test]
    fn explicit_alignment_wins_when_stronger() {
        let r = randomizer(LibcMalloc, 3, 2);
        let p = r.allocate_aligned(10, 9).unwrap();
        assert!(aligned_to_bits(p.as_ptr(), 9));
        unsafe { r.deallocate(p.as_ptr()) };

        let p = r.allocate_aligned(10, 1).unwrap();
        assert!(aligned_to_bits(p.as_ptr(), 3));
        unsafe { r.deallocate(p.as_ptr()) };
    }

    #[test]
    fn calculate_reserve_follows_the_config() {
        let r = Randomizer::new(LibcMalloc);
        assert_eq!(r.calculate_reserve(0), HEADER_SIZE);
        r.config().set_align_bits(4);
        assert_eq!(r.calculate_reserve(0), cmp::max(HEADER_SIZE, 15));
        r.config().set_align_bits(10);
        assert_eq!(r.calculate_reserve(4), 1024 - 16);
    }

    #[test]
    fn global_alloc_honours_layouts() {
        let r = randomizer(CountingAlloc::new(LibcMalloc), 0, 3);
        for align in [1, 2, 8, 64, 4096] {
            let layout = Layout::from_size_align(24, align).unwrap();
            unsafe {
                let p = r.alloc(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                r.dealloc(p, layout);
            }
        }
        assert_eq!(r.allocator().stats().live(), 0);
    }

    #[test]
    fn placements_serialize_with_addresses() {
        let placement = Placement {
            block: 0x1000 as *mut u8,
            user: 0x1010 as *mut u8,
            size: 4,
            reserve: 24,
            align_bits: 4,
        };
        assert_eq!(placement.offset(), 16);
        let json = serde_json::to_value(placement).unwrap();
        assert_eq!(json["block"], 4096);
        assert_eq!(json["user"], 4112);
    }

    #[test]
    fn concurrent_traffic_loses_no_blocks() {
        let r = randomizer(CountingAlloc::new(LibcMalloc), 5, 3);
        crossbeam::scope(|s| {
            for t in 0..4 {
                let r = &r;
                s.spawn(move |_| {
                    let mut live = Vec::with_capacity(100);
                    for cycle in 0..50 {
                        for i in 0..100 {
                            let size = (t * 31 + cycle * 7 + i) % 200;
                            let p = r.allocate(size).unwrap();
                            assert!(aligned_to_bits(p.as_ptr(), 5));
                            unsafe { p.as_ptr().write_bytes(t as u8, size) };
                            live.push(p);
                        }
                        for p in live.drain(..) {
                            unsafe { r.deallocate(p.as_ptr()) };
                        }
                    }
                });
            }
        })
        .unwrap();
        let stats = r.allocator().stats();
        assert_eq!(stats.allocated, 4 * 50 * 100);
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.failed, 0);
    }
}
