/// Test if `ptr` is aligned to `2^bits` bytes
pub fn aligned_to_bits<T>(ptr: *const T, bits: u32) -> bool {
    ptr as usize & ((1usize << bits) - 1) == 0
}

/// Test if `[inner, inner + inner_len)` lies entirely inside
/// `[outer, outer + outer_len)`
pub fn contained_in(inner: usize, inner_len: usize, outer: usize, outer_len: usize) -> bool {
    inner >= outer && inner + inner_len <= outer + outer_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_to_bits_checks_low_bits() {
        assert!(aligned_to_bits(0x1000 as *const u8, 12));
        assert!(!aligned_to_bits(0x1008 as *const u8, 4));
        assert!(aligned_to_bits(0x1008 as *const u8, 3));
        assert!(aligned_to_bits(0x1001 as *const u8, 0));
    }

    #[test]
    fn contained_in_respects_both_ends() {
        assert!(contained_in(10, 5, 10, 5));
        assert!(contained_in(12, 0, 10, 5));
        assert!(!contained_in(9, 2, 10, 5));
        assert!(!contained_in(12, 4, 10, 5));
    }
}
