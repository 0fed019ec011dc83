//! How many bytes to ask the underlying allocator for on top of the
//! caller's size.
//!
//! The underlying allocator promises `2^baseline_bits` alignment. To hand out
//! a `2^align_bits` aligned pointer we need to be able to slide forward by up
//! to `2^align_bits - 2^baseline_bits` bytes, and we always need room for the
//! [`BlockHeader`](super::header::BlockHeader).

use std::cmp;

use crate::util::num::pow2;

use super::header::{HEADER_BITS, HEADER_SIZE};

/// The minimum slack that guarantees room for a header and a `2^align_bits`
/// aligned pointer, given a block that is `2^baseline_bits` aligned.
///
/// - `align_bits == 0`: just the header.
/// - otherwise: `max(HEADER_SIZE, 2^align_bits - 2^baseline_bits)`, which
///   collapses to `HEADER_SIZE` once the baseline already meets the target.
///
/// Exponents above [`MAX_BITS`](crate::config::MAX_BITS) are a
/// precondition violation.
pub fn reserve_for(align_bits: u32, baseline_bits: u32) -> usize {
    if align_bits == 0 {
        return HEADER_SIZE;
    }
    let target = pow2(align_bits).unwrap_or(usize::MAX);
    let baseline = pow2(baseline_bits).unwrap_or(usize::MAX);
    cmp::max(HEADER_SIZE, target.saturating_sub(baseline))
}

/// Everything the allocation wrapper adds to a request, or `None` if that
/// does not fit in a `usize`.
///
/// On top of [`reserve_for()`] this covers two things:
///
/// - When `align_bits > 0` the alignment slide may eat the whole alignment
///   reserve, so the header gets its own `HEADER_SIZE` bytes. The slide is
///   measured from `block + HEADER_SIZE`, which is only
///   `min(2^baseline_bits, HEADER_SIZE)` aligned, hence the clamped
///   baseline.
/// - `2^random_bits` candidate positions spaced `2^align_bits` apart.
pub fn placement_reserve(align_bits: u32, random_bits: u32, baseline_bits: u32) -> Option<usize> {
    let span = pow2(random_bits)?
        .checked_sub(1)?
        .checked_mul(pow2(align_bits)?)?;
    let slack = if align_bits == 0 {
        reserve_for(0, baseline_bits)
    } else {
        HEADER_SIZE.checked_add(reserve_for(align_bits, cmp::min(baseline_bits, HEADER_BITS)))?
    };
    slack.checked_add(span)
}
