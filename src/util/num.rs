/// `2^bits`, or `None` if that does not fit in a `usize`
pub fn pow2(bits: u32) -> Option<usize> {
    1usize.checked_shl(bits)
}

/// Round up `n` to the nearest multiple of `to`, which must be a power of two
pub fn round_up_pow2(n: usize, to: usize) -> usize {
    debug_assert!(to.is_power_of_two());
    (n + to - 1) & !(to - 1)
}

/// `log2(align)` for a power-of-two `align`
pub fn align_bits_of(align: usize) -> u32 {
    debug_assert!(align.is_power_of_two());
    align.trailing_zeros()
}
