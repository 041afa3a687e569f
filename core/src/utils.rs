//! Small helpers shared by the data path.

/// Reduces `a` into `[0, b)` while avoiding modulo bias in the common cases.
///
/// Power-of-two `b` is a single mask. Small non-power-of-two divisors take
/// the direct remainder. Larger divisors mask against the next power of two
/// and fall back to the true remainder only when the masked value lands out
/// of range, which keeps the frequent power-of-two consumer counts
/// branch-cheap.
#[inline]
pub fn fold(a: u32, b: u32) -> u32 {
    debug_assert!(b > 0);
    let c = b - 1;
    if b & c == 0 {
        return a & c;
    }
    if b <= 32 {
        return a % b;
    }
    let p = b.next_power_of_two();
    let r = a & (p - 1);
    if r < b {
        r
    } else {
        a % b
    }
}

/// Mixes the high bytes of a distribution hash down into the low byte range
/// before folding, so narrow eligible sets still see all of the entropy.
#[inline]
pub fn premix(hash: u32) -> u32 {
    hash ^ (hash >> 8) ^ (hash >> 16)
}

/// Iterates over the set bit positions of a 64-bit mask, lowest first.
#[inline]
pub(crate) fn bits(mask: u64) -> BitIter {
    BitIter(mask)
}

pub(crate) struct BitIter(u64);

impl Iterator for BitIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let n = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_stays_in_range() {
        let samples = [
            0u32,
            1,
            7,
            0xff,
            0xdead_beef,
            u32::MAX,
            12345,
            0x8000_0000,
        ];
        for &a in &samples {
            for b in 1..=100u32 {
                assert!(fold(a, b) < b, "fold({a}, {b}) out of range");
            }
        }
    }

    #[test]
    fn fold_power_of_two_is_mask() {
        for &a in &[0u32, 3, 17, 0xffff_ffff] {
            assert_eq!(fold(a, 8), a & 7);
            assert_eq!(fold(a, 64), a & 63);
        }
    }

    #[test]
    fn fold_is_deterministic() {
        for a in 0..1000u32 {
            assert_eq!(fold(a, 12), fold(a, 12));
        }
    }

    #[test]
    fn bit_iteration() {
        let got: Vec<usize> = bits(0b1010_0101).collect();
        assert_eq!(got, vec![0, 2, 5, 7]);
        assert_eq!(bits(0).count(), 0);
        assert_eq!(bits(u64::MAX).count(), 64);
    }
}
