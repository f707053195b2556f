//! Sequence Number Arithmetic
//!
//! TCP sequence and timestamp values live in a 32-bit circular space. Two
//! values are ordered by the sign of their wrapping difference, so a value
//! up to 2^31 ahead of another is considered "greater" even across the wrap.
//! Never compare sequence numbers with the plain integer operators.

/// Signed distance from `b` to `a` in sequence space.
#[inline]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_diff(a, b) < 0
}

#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    seq_diff(a, b) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_diff(a, b) > 0
}

#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    seq_diff(a, b) >= 0
}

/// The later of two sequence numbers.
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_gt(a, b) {
        a
    } else {
        b
    }
}

/// The earlier of two sequence numbers.
#[inline]
pub fn seq_min(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) {
        a
    } else {
        b
    }
}

/// Whether `seq` lies in the half-open range `[start, end)`.
#[inline]
pub fn seq_in_range(seq: u32, start: u32, end: u32) -> bool {
    seq_geq(seq, start) && seq_lt(seq, end)
}

// Timestamps use the same modular ordering as sequence numbers.

#[inline]
pub fn tstmp_lt(a: u32, b: u32) -> bool {
    seq_lt(a, b)
}

#[inline]
pub fn tstmp_geq(a: u32, b: u32) -> bool {
    seq_geq(a, b)
}

#[inline]
pub fn tstmp_gt(a: u32, b: u32) -> bool {
    seq_gt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_without_wrap() {
        assert!(seq_lt(1, 2));
        assert!(seq_leq(2, 2));
        assert!(seq_gt(3, 2));
        assert!(seq_geq(3, 3));
        assert!(!seq_lt(2, 2));
    }

    #[test]
    fn test_ordering_across_wrap() {
        let before = u32::MAX - 10;
        let after = 5u32;
        assert!(seq_lt(before, after));
        assert!(seq_gt(after, before));
        assert_eq!(seq_diff(after, before), 16);
        assert_eq!(seq_max(before, after), after);
        assert_eq!(seq_min(before, after), before);
    }

    #[test]
    fn test_range_membership() {
        assert!(seq_in_range(u32::MAX, u32::MAX - 1, 3));
        assert!(seq_in_range(0, u32::MAX - 1, 3));
        assert!(!seq_in_range(3, u32::MAX - 1, 3));
    }
}
