//! Invalidation set: a Bloom filter over resource keys the backend considers
//! changed.
//!
//! The filter is built elsewhere and shipped as `{ b, m, h }`. It is never
//! mutated here; a refresh publishes a whole new instance through
//! [`InvalidationSetHandle`].

pub mod murmur;

use chrono::{DateTime, Utc};
use common::bloom::BloomFilterPayload;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use murmur::murmur3_32;

#[derive(Debug, Error)]
pub enum BloomFilterError {
    #[error("bit array is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("bit length must be positive")]
    EmptyBitArray,
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bytes: Vec<u8>,
    bits: u64,
    hashes: u32,
    created_at: DateTime<Utc>,
}

impl BloomFilter {
    pub fn new(bytes: Vec<u8>, bits: u64, hashes: u32) -> Result<Self, BloomFilterError> {
        if bits == 0 {
            return Err(BloomFilterError::EmptyBitArray);
        }
        Ok(Self {
            bytes,
            bits,
            hashes,
            created_at: Utc::now(),
        })
    }

    pub fn from_payload(payload: &BloomFilterPayload) -> Result<Self, BloomFilterError> {
        let bytes = payload.decode_bits()?;
        Self::new(bytes, payload.m, payload.h)
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn to_payload(&self) -> BloomFilterPayload {
        BloomFilterPayload::from_bytes(&self.bytes, self.bits, self.hashes)
    }

    /// Probe positions for `key` in a filter of `bits` bits with `hashes`
    /// hash functions (double hashing over two murmur3 rounds).
    pub fn positions(key: &str, bits: u64, hashes: u32) -> impl Iterator<Item = u64> {
        let h1 = murmur3_32(key.as_bytes(), 0);
        let h2 = murmur3_32(key.as_bytes(), h1);
        let (h1, h2) = (u64::from(h1), u64::from(h2));
        (0..u64::from(hashes)).map(move |i| (h1 + i * h2) % bits)
    }

    /// `false` means the key was definitely not in the set when it was built.
    pub fn may_contain(&self, key: &str) -> bool {
        Self::positions(key, self.bits, self.hashes).all(|pos| self.is_set(pos))
    }

    fn is_set(&self, position: u64) -> bool {
        let Ok(index) = usize::try_from(position / 8) else {
            return false;
        };
        let mask = 1u8 << (position % 8);
        self.bytes.get(index).is_some_and(|byte| byte & mask != 0)
    }
}

/// Shared, atomically swapped reference to the current filter.
///
/// Readers take an `Arc` snapshot and keep using it even if a refresh
/// publishes a replacement meanwhile.
#[derive(Clone, Default)]
pub struct InvalidationSetHandle {
    current: Arc<RwLock<Option<Arc<BloomFilter>>>>,
}

impl InvalidationSetHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self) -> Option<Arc<BloomFilter>> {
        self.current.read().await.clone()
    }

    pub async fn publish(&self, filter: BloomFilter) {
        let filter = Arc::new(filter);
        *self.current.write().await = Some(filter);
    }

    /// `None` when no filter has loaded yet.
    pub async fn may_contain(&self, key: &str) -> Option<bool> {
        self.load().await.map(|filter| filter.may_contain(key))
    }
}

#[cfg(test)]
pub(crate) fn filter_with_keys(keys: &[&str], bits: u64, hashes: u32) -> BloomFilter {
    let len = usize::try_from(bits.div_ceil(8)).unwrap();
    let mut bytes = vec![0u8; len];
    for key in keys {
        for pos in BloomFilter::positions(key, bits, hashes) {
            bytes[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }
    BloomFilter::new(bytes, bits, hashes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_reported() {
        let keys: Vec<String> = (0..500).map(|i| format!("/file/_bq_assets/key-{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let filter = filter_with_keys(&refs, 8192, 4);

        for key in &refs {
            assert!(filter.may_contain(key), "false negative for {key}");
        }
    }

    #[test]
    fn false_positive_rate_stays_within_bound() {
        // 500 keys, 8192 bits, 4 hashes: expected rate is about 0.2%.
        let keys: Vec<String> = (0..500).map(|i| format!("present-{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let filter = filter_with_keys(&refs, 8192, 4);

        let trials = 10_000;
        let false_positives = (0..trials)
            .filter(|i| filter.may_contain(&format!("absent-{i}")))
            .count();
        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.01, "false positive rate too high: {rate}");
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![0u8; 16], 128, 3).unwrap();
        assert!(!filter.may_contain("/file/_bq_assets/anything"));
    }

    #[test]
    fn saturated_filter_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 16], 128, 3).unwrap();
        assert!(filter.may_contain("/file/_bq_assets/anything"));
    }

    #[test]
    fn out_of_range_bytes_read_as_unset() {
        // Claims 1024 bits but only ships one byte of them.
        let filter = BloomFilter::new(vec![0xff], 1024, 5).unwrap();
        let positions: Vec<u64> = BloomFilter::positions("key", 1024, 5).collect();
        let expected = positions.iter().all(|p| *p < 8);
        assert_eq!(filter.may_contain("key"), expected);
    }

    #[test]
    fn positions_use_double_hashing() {
        let h1 = u64::from(murmur3_32(b"key", 0));
        let h2 = u64::from(murmur3_32(b"key", h1 as u32));
        let positions: Vec<u64> = BloomFilter::positions("key", 1000, 3).collect();
        assert_eq!(positions, vec![h1 % 1000, (h1 + h2) % 1000, (h1 + 2 * h2) % 1000]);
    }

    #[test]
    fn zero_bits_is_rejected() {
        assert!(matches!(
            BloomFilter::new(Vec::new(), 0, 3),
            Err(BloomFilterError::EmptyBitArray)
        ));
    }

    #[test]
    fn payload_with_bad_base64_is_rejected() {
        let payload = BloomFilterPayload {
            b: "not base64!".into(),
            m: 8,
            h: 1,
        };
        assert!(matches!(
            BloomFilter::from_payload(&payload),
            Err(BloomFilterError::InvalidEncoding(_))
        ));
    }

    #[tokio::test]
    async fn handle_swaps_whole_filters() {
        let handle = InvalidationSetHandle::new();
        assert_eq!(handle.may_contain("a").await, None);

        handle.publish(filter_with_keys(&["a"], 256, 3)).await;
        let first = handle.load().await.unwrap();
        assert_eq!(handle.may_contain("a").await, Some(true));

        handle.publish(BloomFilter::new(vec![0u8; 32], 256, 3).unwrap()).await;
        assert_eq!(handle.may_contain("a").await, Some(false));
        // A snapshot taken before the swap is unaffected.
        assert!(first.may_contain("a"));
    }
}
