//! Pool counters. Cheap enough to keep always-on; tests assert against
//! snapshots to pin down reuse and eviction behavior.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PoolStats {
    devices_created: AtomicU64,
    devices_destroyed: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions_lru: AtomicU64,
    evictions_worn: AtomicU64,
    evictions_fatal: AtomicU64,
    unsupported_skips: AtomicU64,
    reclaim_passes: AtomicU64,
}

impl PoolStats {
    pub(crate) fn inc_devices_created(&self) {
        self.devices_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_devices_destroyed(&self) {
        self.devices_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_acquires(&self) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_releases(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_evictions_lru(&self) {
        self.evictions_lru.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_evictions_worn(&self) {
        self.evictions_worn.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_evictions_fatal(&self) {
        self.evictions_fatal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_unsupported_skips(&self) {
        self.unsupported_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_reclaim_passes(&self) {
        self.reclaim_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            devices_created: self.devices_created.load(Ordering::Relaxed),
            devices_destroyed: self.devices_destroyed.load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions_lru: self.evictions_lru.load(Ordering::Relaxed),
            evictions_worn: self.evictions_worn.load(Ordering::Relaxed),
            evictions_fatal: self.evictions_fatal.load(Ordering::Relaxed),
            unsupported_skips: self.unsupported_skips.load(Ordering::Relaxed),
            reclaim_passes: self.reclaim_passes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub devices_created: u64,
    pub devices_destroyed: u64,
    pub acquires: u64,
    pub releases: u64,
    /// Acquisitions served from the holder map instead of a fresh request.
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions_lru: u64,
    pub evictions_worn: u64,
    pub evictions_fatal: u64,
    /// Acquisitions refused because the adapter cannot satisfy the
    /// descriptor, fresh or served from the negative cache.
    pub unsupported_skips: u64,
    pub reclaim_passes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PoolStats::default();
        stats.inc_devices_created();
        stats.inc_devices_created();
        stats.inc_cache_hits();
        stats.inc_reclaim_passes();
        let snap = stats.snapshot();
        assert_eq!(snap.devices_created, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.reclaim_passes, 1);
        assert_eq!(snap.devices_destroyed, 0);
    }
}
