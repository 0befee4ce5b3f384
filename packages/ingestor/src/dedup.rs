//! Transaction Deduplication
//!
//! Bounded membership cache of recently processed transaction hashes.
//! A subscription reset can re-deliver transactions that were already seen;
//! anything still resident here is skipped.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Default number of transaction hashes remembered
pub const DEFAULT_DEDUP_CAPACITY: usize = 10;

/// Least-recently-used set of transaction hashes
///
/// Only the ingest task touches it, so it carries no locking of its own.
pub struct Deduplicator {
    seen: LruCache<String, ()>,
}

impl Deduplicator {
    /// Create a cache holding at most `capacity` hashes (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.seen.contains(tx_hash)
    }

    /// Remember a hash, evicting the least recently recorded one when full
    pub fn record(&mut self, tx_hash: impl Into<String>) {
        self.seen.put(tx_hash.into(), ());
    }

    /// Record the hash and report whether it was new
    pub fn check_and_record(&mut self, tx_hash: &str) -> bool {
        if self.contains(tx_hash) {
            return false;
        }
        self.record(tx_hash);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.seen.cap().get()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Membership tests ====================

    #[test]
    fn test_record_then_contains() {
        let mut dedup = Deduplicator::default();
        assert!(!dedup.contains("aa"));
        dedup.record("aa");
        assert!(dedup.contains("aa"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_check_and_record_reports_first_sight_only() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.check_and_record("aa"));
        assert!(!dedup.check_and_record("aa"));
        assert!(!dedup.check_and_record("aa"));
    }

    // ==================== Eviction tests ====================

    #[test]
    fn test_oldest_hash_evicted_at_capacity() {
        let mut dedup = Deduplicator::new(3);
        for hash in ["a", "b", "c", "d"] {
            dedup.record(hash);
        }
        assert!(!dedup.contains("a"));
        assert!(dedup.contains("b"));
        assert!(dedup.contains("d"));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_re_recording_refreshes_recency() {
        let mut dedup = Deduplicator::new(2);
        dedup.record("a");
        dedup.record("b");
        dedup.record("a");
        dedup.record("c");
        assert!(dedup.contains("a"));
        assert!(!dedup.contains("b"));
    }

    #[test]
    fn test_contains_does_not_refresh_recency() {
        let mut dedup = Deduplicator::new(2);
        dedup.record("a");
        dedup.record("b");
        assert!(dedup.contains("a"));
        dedup.record("c");
        assert!(!dedup.contains("a"));
    }

    // ==================== Capacity tests ====================

    #[test]
    fn test_zero_capacity_clamps_to_one() {
        let mut dedup = Deduplicator::new(0);
        assert_eq!(dedup.capacity(), 1);
        dedup.record("a");
        dedup.record("b");
        assert!(!dedup.contains("a"));
        assert!(dedup.contains("b"));
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(Deduplicator::default().capacity(), DEFAULT_DEDUP_CAPACITY);
        assert!(Deduplicator::default().is_empty());
    }
}
