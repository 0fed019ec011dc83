//! Where the random offsets come from.
//!
//! Every thread owns a [`SmallRng`], so drawing an offset is a handful of
//! arithmetic ops with no lock and no shared cache line. The generator lives
//! in a const-initialized `thread_local!` with no destructor, which means
//! touching it never allocates, not even on a thread's first draw.
//!
//! The thread's generator belongs to one [`Entropy`] at a time. When a thread
//! draws from a different source than last time, it takes a fresh stream
//! from that source, so what a source hands out depends only on its seed and
//! the order in which it is used, never on which other sources ran before.

use std::{
    cell::RefCell,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Source ids, `0` means "not assigned yet"
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The id of the owning source and its generator
    static RNG: RefCell<Option<(u64, SmallRng)>> = const { RefCell::new(None) };
}

fn stream_seed(seed: u64, stream: u64) -> u64 {
    seed ^ stream.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// A seeded source of offsets. Streams are handed out per thread, in the
/// order threads (re)attach to the source.
#[derive(Debug)]
pub struct Entropy {
    seed: u64,
    id: AtomicU64,
    next_stream: AtomicU64,
}

impl Entropy {
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            id: AtomicU64::new(0),
            next_stream: AtomicU64::new(0),
        }
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    fn id(&self) -> u64 {
        let id = self.id.load(Ordering::Relaxed);
        if id != 0 {
            return id;
        }
        let fresh = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        match self
            .id
            .compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => fresh,
            Err(winner) => winner,
        }
    }

    /// A value uniformly distributed in `[0, 2^bits)`. `bits == 0` always
    /// yields `0` without touching the generator.
    pub fn draw(&self, bits: u32) -> usize {
        if bits == 0 {
            return 0;
        }
        debug_assert!(bits < usize::BITS);
        let mask = (1usize << bits) - 1;
        let id = self.id();
        RNG.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.as_ref().is_some_and(|(owner, _)| *owner != id) {
                *slot = None;
            }
            let (_, rng) = slot.get_or_insert_with(|| {
                let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
                (id, SmallRng::seed_from_u64(stream_seed(self.seed, stream)))
            });
            rng.gen::<usize>() & mask
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bits_is_always_zero() {
        let entropy = Entropy::new(1);
        for _ in 0..100 {
            assert_eq!(entropy.draw(0), 0);
        }
    }

    #[test]
    fn draws_stay_in_range() {
        let entropy = Entropy::new(1);
        for bits in 1..12 {
            for _ in 0..1000 {
                assert!(entropy.draw(bits) < 1 << bits);
            }
        }
    }

    #[test]
    fn draws_cover_the_range() {
        let entropy = Entropy::new(1);
        let mut seen = [false; 16];
        for _ in 0..10_000 {
            seen[entropy.draw(4)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let a = Entropy::new(42);
        let b = Entropy::new(42);
        let from_a: Vec<_> = (0..16).map(|_| a.draw(20)).collect();
        let from_b: Vec<_> = (0..16).map(|_| b.draw(20)).collect();
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn interleaved_sources_do_not_disturb_each_other() {
        let a = Entropy::new(7);
        let b = Entropy::new(7);
        let other = Entropy::new(8);
        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..16 {
            from_a.push(a.draw(20));
            other.draw(20);
            from_b.push(b.draw(20));
            other.draw(20);
        }
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn different_seeds_diverge() {
        let a = Entropy::new(1);
        let b = Entropy::new(2);
        let from_a: Vec<_> = (0..16).map(|_| a.draw(30)).collect();
        let from_b: Vec<_> = (0..16).map(|_| b.draw(30)).collect();
        assert_ne!(from_a, from_b);
    }

    #[test]
    fn threads_get_distinct_streams() {
        let entropy = Entropy::new(5);
        let (a, b) = crossbeam::scope(|s| {
            let a = s.spawn(|_| (0..8).map(|_| entropy.draw(30)).collect::<Vec<_>>());
            let b = s.spawn(|_| (0..8).map(|_| entropy.draw(30)).collect::<Vec<_>>());
            (a.join().unwrap(), b.join().unwrap())
        })
        .unwrap();
        assert_ne!(a, b);
    }
}
