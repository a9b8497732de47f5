//! Per-block bloom filter over anchor-window hashes.
//!
//! Probed before the block's hash table on every candidate anchor, so the
//! common miss case never touches the table.  Two probe bits per value,
//! derived from the low and high halves of the 64-bit window hash.

pub struct BloomFilter {
    words: Vec<u64>,
    mask:  u64,
}

impl BloomFilter {
    /// `bits` is rounded up to a power of two, 64 minimum.
    pub fn new(bits: usize) -> Self {
        let bits = bits.max(64).next_power_of_two();
        BloomFilter {
            words: vec![0u64; bits / 64],
            mask:  (bits - 1) as u64,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.words.len() * 8
    }

    #[inline]
    pub fn add(&mut self, hash: u64) {
        let a = hash & self.mask;
        let b = (hash >> 32 ^ hash << 32) & self.mask;
        self.words[(a / 64) as usize] |= 1u64 << (a % 64);
        self.words[(b / 64) as usize] |= 1u64 << (b % 64);
    }

    #[inline]
    pub fn contains(&self, hash: u64) -> bool {
        let a = hash & self.mask;
        let b = (hash >> 32 ^ hash << 32) & self.mask;
        self.words[(a / 64) as usize] & (1u64 << (a % 64)) != 0
            && self.words[(b / 64) as usize] & (1u64 << (b % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_values_are_found() {
        let mut f = BloomFilter::new(1 << 16);
        for i in 0..1000u64 {
            f.add(i.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        }
        for i in 0..1000u64 {
            assert!(f.contains(i.wrapping_mul(0x9e37_79b9_7f4a_7c15)));
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let mut f = BloomFilter::new(1 << 16);
        for i in 0..1000u64 {
            f.add(i.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        }
        let fp = (1000..11_000u64)
            .filter(|i| f.contains(i.wrapping_mul(0x9e37_79b9_7f4a_7c15)))
            .count();
        assert!(fp < 200, "false positive count {fp} too high");
    }

    #[test]
    fn tiny_filter_is_padded() {
        let f = BloomFilter::new(1);
        assert_eq!(f.size_in_bytes(), 8);
    }
}
