//! zonekv - Bloom Filter
//! A space-efficient probabilistic data structure used to test
//! whether an element is a member of a set.
//!
//! False positives are possible, but false negatives are not.
//! Used by sorted files to skip block reads for keys that
//! definitely do not exist in a given table.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// A Bloom filter over user keys, stored in a sorted file's filter block.
///
/// ## How it works
/// - Multiple hash functions map each key to bit positions
/// - On insert: set all corresponding bits to 1
/// - On lookup: check if all corresponding bits are 1
/// - If any bit is 0 → key is **definitely not** in the set
/// - If all bits are 1 → key is **probably** in the set
///
/// Hashes are CRC32 based so a filter written by one process reads back the
/// same in another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// Bit array stored as bytes.
    bits: Vec<u8>,
    /// Number of bits in the filter.
    num_bits: usize,
    /// Number of hash functions to use.
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` keys at `bits_per_key`.
    ///
    /// Optimal hashes: `k = bits_per_key * ln(2)`.
    pub fn new(expected_items: usize, bits_per_key: usize) -> Self {
        let num_bits = (expected_items.max(1) * bits_per_key).max(64);
        let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    /// Insert a key into the Bloom filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hashes(key);
        for i in 0..self.num_hashes {
            let bit_index = self.bit_index(h1, h2, i);
            self.bits[bit_index / 8] |= 1 << (bit_index % 8);
        }
    }

    /// Check if a key **may** be in the set.
    /// - Returns `false` → key is **definitely not** in the set
    /// - Returns `true` → key is **probably** in the set (may be false positive)
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hashes(key);
        (0..self.num_hashes).all(|i| {
            let bit_index = self.bit_index(h1, h2, i);
            self.bits[bit_index / 8] & (1 << (bit_index % 8)) != 0
        })
    }

    /// Returns the number of hash functions used.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Returns the approximate memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.bits.len()
    }

    /// `[bits][num_bits: u32][num_hashes: u8]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bits.len() + 5);
        buf.put_slice(&self.bits);
        buf.put_u32_le(self.num_bits as u32);
        buf.put_u8(self.num_hashes as u8);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::Corruption("filter block too short".into()));
        }
        let (bits, mut trailer) = data.split_at(data.len() - 5);
        let num_bits = trailer.get_u32_le() as usize;
        let num_hashes = trailer.get_u8() as u32;
        if num_bits.div_ceil(8) != bits.len() || num_hashes == 0 {
            return Err(Error::Corruption("filter block size mismatch".into()));
        }
        Ok(Self {
            bits: bits.to_vec(),
            num_bits,
            num_hashes,
        })
    }

    /// Double hashing: `h(i) = h1 + i * h2 (mod m)`.
    fn bit_index(&self, h1: u32, h2: u32, i: u32) -> usize {
        (h1.wrapping_add(i.wrapping_mul(h2)) as usize) % self.num_bits
    }

    fn hashes(key: &[u8]) -> (u32, u32) {
        let h1 = crc32fast::hash(key);
        let mut hasher = crc32fast::Hasher::new_with_initial(0xbc9f_1d34);
        hasher.update(key);
        (h1, hasher.finalize() | 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut bf = BloomFilter::new(100, 10);
        bf.insert(b"hello");
        bf.insert(b"world");

        assert!(bf.may_contain(b"hello"));
        assert!(bf.may_contain(b"world"));
    }

    #[test]
    fn test_definitely_not_contains() {
        let mut bf = BloomFilter::new(100, 10);
        bf.insert(b"alpha");
        bf.insert(b"bravo");

        let false_positives = (0..1000)
            .filter(|i| bf.may_contain(format!("nonexistent_key_{}", i).as_bytes()))
            .count();
        assert!(
            false_positives < 50,
            "Too many false positives: {}",
            false_positives
        );
    }

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::new(500, 10);
        for i in 0..500 {
            bf.insert(format!("key_{}", i).as_bytes());
        }
        for i in 0..500 {
            let key = format!("key_{}", i);
            assert!(bf.may_contain(key.as_bytes()), "False negative for key: {}", key);
        }
    }

    #[test]
    fn test_encoded_filter_answers_the_same() {
        let mut bf = BloomFilter::new(50, 10);
        for i in 0..50 {
            bf.insert(format!("k{}", i).as_bytes());
        }
        let decoded = BloomFilter::decode(&bf.encode()).unwrap();
        assert_eq!(decoded, bf);
        assert!(decoded.may_contain(b"k7"));
        assert!(decoded.memory_usage() > 0);
        assert!(decoded.num_hashes() >= 2);
    }

    #[test]
    fn test_rejects_bad_trailer() {
        assert!(BloomFilter::decode(&[1, 2, 3]).is_err());
        let mut encoded = BloomFilter::new(10, 10).encode();
        let len = encoded.len();
        encoded[len - 5] = 0xff;
        assert!(BloomFilter::decode(&encoded).is_err());
    }
}
