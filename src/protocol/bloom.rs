//! Duplicate-suppression bloom filter
//!
//! Sized from an expected item count and target false-positive rate.
//! False negatives are impossible; the router relies on that to never
//! re-forward a dropped duplicate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bloom filter over byte keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomSet {
    bits: Vec<u8>,
    bit_count: usize,
    hash_count: usize,
    items_added: usize,
}

impl BloomSet {
    /// Size for `expected_items` at `false_positive_rate`
    ///
    /// m = ceil(-n * ln(p) / ln(2)^2), k = ceil((m / n) * ln(2))
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let bit_count = (-(n * p.ln()) / (ln2 * ln2)).ceil() as usize;
        let bit_count = bit_count.max(8);
        let hash_count = ((bit_count as f64 / n) * ln2).ceil() as usize;
        let hash_count = hash_count.clamp(1, 7);

        Self {
            bits: vec![0u8; bit_count.div_ceil(8)],
            bit_count,
            hash_count,
            items_added: 0,
        }
    }

    /// Derive the i-th bit index from a SHA-256 of the key
    ///
    /// Four digest bytes starting at (4*i mod 28), interpreted big-endian,
    /// reduced mod the bit count.
    fn bit_indexes(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let digest = Sha256::digest(key);
        (0..self.hash_count).map(move |i| {
            let offset = (4 * i) % 28;
            let word = u32::from_be_bytes(
                digest[offset..offset + 4].try_into().expect("4-byte window"),
            );
            word as usize % self.bit_count
        })
    }

    pub fn add(&mut self, key: &[u8]) {
        let indexes: Vec<usize> = self.bit_indexes(key).collect();
        for index in indexes {
            self.bits[index / 8] |= 1 << (index % 8);
        }
        self.items_added += 1;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.bit_indexes(key)
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Clear all bits; scheduled resets go through here
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|byte| *byte = 0);
        self.items_added = 0;
    }

    /// Fraction of bits set
    pub fn fill_rate(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|byte| byte.count_ones()).sum();
        set as f64 / self.bit_count as f64
    }

    pub fn items_added(&self) -> usize {
        self.items_added
    }

    /// Snapshot for persistence or transfer
    pub fn export(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12 + self.bits.len());
        bytes.extend_from_slice(&(self.bit_count as u32).to_be_bytes());
        bytes.extend_from_slice(&(self.hash_count as u32).to_be_bytes());
        bytes.extend_from_slice(&(self.items_added as u32).to_be_bytes());
        bytes.extend_from_slice(&self.bits);
        bytes
    }

    /// Rebuild from an exported snapshot
    pub fn import(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let bit_count = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as usize;
        let hash_count = u32::from_be_bytes(bytes[4..8].try_into().ok()?) as usize;
        let items_added = u32::from_be_bytes(bytes[8..12].try_into().ok()?) as usize;
        let bits = bytes[12..].to_vec();
        if bit_count == 0 || hash_count == 0 || bits.len() != bit_count.div_ceil(8) {
            return None;
        }
        Some(Self {
            bits,
            bit_count,
            hash_count,
            items_added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = BloomSet::new(1_000, 0.01);
        for i in 0..1_000u32 {
            bloom.add(&i.to_be_bytes());
        }
        for i in 0..1_000u32 {
            assert!(bloom.contains(&i.to_be_bytes()), "lost item {i}");
        }
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut bloom = BloomSet::new(1_000, 0.01);
        for i in 0..1_000u32 {
            bloom.add(&i.to_be_bytes());
        }
        let false_positives = (1_000u32..11_000)
            .filter(|i| bloom.contains(&i.to_be_bytes()))
            .count();
        // 2x headroom over the target rate
        assert!(false_positives < 200, "{false_positives} false positives");
    }

    #[test]
    fn test_clear() {
        let mut bloom = BloomSet::new(100, 0.01);
        bloom.add(b"key");
        assert!(bloom.contains(b"key"));
        assert!(bloom.fill_rate() > 0.0);

        bloom.clear();
        assert!(!bloom.contains(b"key"));
        assert_eq!(bloom.fill_rate(), 0.0);
        assert_eq!(bloom.items_added(), 0);
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut bloom = BloomSet::new(500, 0.02);
        for i in 0..100u32 {
            bloom.add(&i.to_be_bytes());
        }

        let restored = BloomSet::import(&bloom.export()).unwrap();
        assert_eq!(restored.items_added(), 100);
        for i in 0..100u32 {
            assert!(restored.contains(&i.to_be_bytes()));
        }
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(BloomSet::import(&[1, 2, 3]).is_none());
        assert!(BloomSet::import(&[0u8; 64]).is_none());
    }
}
