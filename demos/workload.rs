//! Runs the two-thread reference workload on top of a counting `malloc()`
//! and prints a JSON report.
//!
//! ```text
//! ALLOC_RANDOMIZER_ALIGN_BITS=4 ALLOC_RANDOMIZER_RANDOM_BITS=3 \
//!     RUST_LOG=info cargo run --release --example workload -- 1000
//! ```
//!
//! The optional argument is the number of cycles per thread.

use std::{collections::BTreeMap, env, time::Instant};

use alloc_randomizer::{CountingAlloc, LibcMalloc, Placement, Randomizer, Settings, Stats};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;

const THREADS: usize = 2;
const BLOCKS_PER_CYCLE: usize = 1000;
const DEFAULT_CYCLES: usize = 1000;
const SAMPLES: usize = 8;

static RANDOMIZER: Randomizer<CountingAlloc<LibcMalloc>> =
    Randomizer::from_env(CountingAlloc::new(LibcMalloc));

#[derive(Serialize)]
struct Report {
    settings: Settings,
    cycles_per_thread: usize,
    elapsed_ms: u128,
    stats: Stats,
    /// How often each user-pointer offset into its block came up
    offsets: BTreeMap<usize, usize>,
    samples: Vec<Placement>,
}

fn main() {
    env_logger::init();

    let cycles = match env::args().nth(1).map(|arg| arg.parse()) {
        None => DEFAULT_CYCLES,
        Some(Ok(cycles)) => cycles,
        Some(Err(err)) => {
            log::error!("cycle count must be a number: {err}");
            std::process::exit(2);
        }
    };

    let settings = RANDOMIZER.config().snapshot();
    log::info!("running {THREADS} threads x {cycles} cycles with {settings:?}");

    let start = Instant::now();
    let offsets = crossbeam::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|thread| s.spawn(move |_| worker(thread as u64, cycles)))
            .collect();
        let mut offsets = BTreeMap::new();
        for worker in workers {
            for (offset, count) in worker.join().expect("worker panicked") {
                *offsets.entry(offset).or_insert(0) += count;
            }
        }
        offsets
    })
    .expect("workload panicked");
    let elapsed_ms = start.elapsed().as_millis();

    let samples = (0..SAMPLES)
        .filter_map(|i| RANDOMIZER.place(i * 24, 0).ok())
        .collect::<Vec<_>>();
    for sample in &samples {
        // SAFETY: just placed above, freed once
        unsafe { RANDOMIZER.deallocate(sample.user) };
    }

    let stats = RANDOMIZER.allocator().stats();
    if stats.live() != 0 {
        log::error!("{} blocks leaked", stats.live());
    }

    let report = Report {
        settings,
        cycles_per_thread: cycles,
        elapsed_ms,
        stats,
        offsets,
        samples,
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => log::error!("could not serialize report: {err}"),
    }
}

fn worker(thread: u64, cycles: usize) -> BTreeMap<usize, usize> {
    let mut rng = SmallRng::seed_from_u64(thread);
    let mut blocks = Vec::with_capacity(BLOCKS_PER_CYCLE);
    let mut offsets = BTreeMap::new();
    for _ in 0..cycles {
        for _ in 0..BLOCKS_PER_CYCLE {
            let size = rng.gen_range(0..256);
            match RANDOMIZER.place(size, 0) {
                Ok(placement) => {
                    *offsets.entry(placement.offset()).or_insert(0) += 1;
                    blocks.push(placement.user);
                }
                Err(err) => log::warn!("{err}"),
            }
        }
        for block in blocks.drain(..) {
            // SAFETY: placed above, freed exactly once
            unsafe { RANDOMIZER.deallocate(block) };
        }
    }
    offsets
}
