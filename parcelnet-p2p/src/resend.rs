//! Resend filter.
//!
//! Remembers which application payloads a peer sent us, so a broadcast of
//! the same payload can skip that peer. Entries expire after
//! `buckets × interval`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Maximum number of payload hashes remembered per peer.
const DEFAULT_CAPACITY: usize = 4096;

/// Hash identifying an application payload.
pub fn payload_hash(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Time limited LRU set of payload hashes.
pub struct ResendFilter {
    cache: Mutex<LruCache<[u8; 32], Instant>>,
    window: Duration,
}

impl ResendFilter {
    /// Filter remembering hashes for `buckets × interval`.
    pub fn new(buckets: usize, interval: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, interval * buckets.max(1) as u32)
    }

    pub fn with_capacity(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    /// Record that the peer sent us this payload hash.
    pub fn record(&self, hash: [u8; 32]) {
        self.record_at(hash, Instant::now());
    }

    pub(crate) fn record_at(&self, hash: [u8; 32], now: Instant) {
        self.cache.lock().put(hash, now);
    }

    /// True if the peer sent us this payload hash within the window.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.contains_at(hash, Instant::now())
    }

    pub(crate) fn contains_at(&self, hash: &[u8; 32], now: Instant) -> bool {
        let mut cache = self.cache.lock();
        match cache.peek(hash) {
            Some(seen) if now.duration_since(*seen) <= self.window => true,
            Some(_) => {
                cache.pop(hash);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_contains() {
        let filter = ResendFilter::new(3, Duration::from_secs(20));
        let a = payload_hash(b"block 1");
        let b = payload_hash(b"block 2");

        filter.record(a);
        assert!(filter.contains(&a));
        assert!(!filter.contains(&b));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_entries_expire() {
        let filter = ResendFilter::new(3, Duration::from_secs(20));
        let hash = payload_hash(b"tx");
        let start = Instant::now();

        filter.record_at(hash, start);
        assert!(filter.contains_at(&hash, start + Duration::from_secs(60)));
        assert!(!filter.contains_at(&hash, start + Duration::from_secs(61)));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let filter = ResendFilter::with_capacity(2, Duration::from_secs(60));
        let hashes = [[1u8; 32], [2u8; 32], [3u8; 32]];
        for h in hashes {
            filter.record(h);
        }

        assert!(!filter.contains(&hashes[0]));
        assert!(filter.contains(&hashes[1]));
        assert!(filter.contains(&hashes[2]));
    }
}
