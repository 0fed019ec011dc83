//! A heap allocation shim that moves your blocks around.
//!
//! Every allocation is served by an ordinary allocator underneath (the C
//! library's `malloc()` by default), but the pointer handed back is placed
//! at a configurable alignment and a random offset inside a slightly larger
//! block. Code that leans on incidental heap layout, such as "malloc always
//! returns 16-byte aligned memory" or "these two allocations are adjacent",
//! breaks quickly and often under it, which is the point.
//!
//! ```no_run
//! use alloc_randomizer::{LibcMalloc, Randomizer};
//!
//! #[global_allocator]
//! static GLOBAL: Randomizer<LibcMalloc> = Randomizer::from_env(LibcMalloc);
//!
//! fn main() {
//!     GLOBAL.config().set_align_bits(5);
//!     GLOBAL.config().set_random_bits(3);
//!     let boxed = Box::new(1u8);
//!     assert_eq!(&*boxed as *const u8 as usize % 32, 0);
//! }
//! ```
//!
//! See [`config`] for the knobs and the environment variables that set them.

pub mod alloc;
pub mod config;
pub mod externc;
mod lazy_lock;
pub mod serialize;
pub mod util;

pub use alloc::{
    global::{
        allocate, allocate_zeroed, calculate_reserve, deallocate, reallocate, set_align_bits,
        set_random_bits,
    },
    randomizer::{AllocError, Placement, Randomizer},
    raw::{CountingAlloc, LibcMalloc, RawAlloc, Stats},
};
pub use config::{Config, ConfigError, Settings};
