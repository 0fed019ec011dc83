//! Installs the randomizer as the global allocator and shows where a few
//! boxes end up.
//!
//! ```text
//! ALLOC_RANDOMIZER_ALIGN_BITS=5 ALLOC_RANDOMIZER_RANDOM_BITS=2 \
//!     cargo run --example global_alloc
//! ```

use alloc_randomizer::{LibcMalloc, Randomizer};

#[global_allocator]
static GLOBAL: Randomizer<LibcMalloc> = Randomizer::from_env(LibcMalloc);

fn main() {
    env_logger::init();
    log::info!("config: {:?}", GLOBAL.config().snapshot());

    let boxes: Vec<Box<u8>> = (0..8).map(Box::new).collect();
    for (i, b) in boxes.iter().enumerate() {
        let addr = &**b as *const u8 as usize;
        println!("box {i}: {addr:#x} (low bits {:#07b})", addr & 0x1f);
    }

    let words: Vec<String> = ["layout", "is", "not", "a", "contract"]
        .iter()
        .map(|w| w.to_string())
        .collect();
    println!("{}", words.join(" "));
}
