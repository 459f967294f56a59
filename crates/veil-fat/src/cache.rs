//! Caches: FAT sectors, cluster chains, directory listings, free space.
//!
//! Correctness comes from invalidation, not size bounds, so eviction is
//! approximate: when the FAT-sector cache overflows, the oldest quarter of
//! entries is dropped in one sweep.

use crate::FileEntry;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Cap on cached FAT sectors (128 KiB of FAT data).
pub(crate) const FAT_CACHE_CAP: usize = 256;

/// FAT sectors fetched ahead on a cache miss.
pub(crate) const FAT_PREFETCH_SECTORS: u64 = 32;

/// LRU-ish map of FAT sector index → sector payload.
pub(crate) struct FatSectorCache {
    map: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
}

impl FatSectorCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn get(&self, index: u64) -> Option<Vec<u8>> {
        self.map.get(&index).cloned()
    }

    pub(crate) fn insert(&mut self, index: u64, payload: Vec<u8>) {
        if self.map.insert(index, payload).is_none() {
            self.order.push_back(index);
        }
        if self.map.len() > FAT_CACHE_CAP {
            // Bulk-evict the oldest quarter.
            let mut dropped = 0;
            while dropped < FAT_CACHE_CAP / 4 {
                let Some(old) = self.order.pop_front() else {
                    break;
                };
                if self.map.remove(&old).is_some() {
                    dropped += 1;
                }
            }
        }
    }
}

/// All engine caches plus the cached free-cluster figure.
pub(crate) struct Caches {
    pub(crate) fat: Mutex<FatSectorCache>,
    chains: Mutex<HashMap<u32, Arc<Vec<u32>>>>,
    listings: Mutex<HashMap<String, Arc<Vec<FileEntry>>>>,
    listing_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    free_clusters: Mutex<Option<u64>>,
}

impl Caches {
    pub(crate) fn new() -> Self {
        Self {
            fat: Mutex::new(FatSectorCache::new()),
            chains: Mutex::new(HashMap::new()),
            listings: Mutex::new(HashMap::new()),
            listing_locks: Mutex::new(HashMap::new()),
            free_clusters: Mutex::new(None),
        }
    }

    // ── Cluster chains ──────────────────────────────────────────────────

    pub(crate) fn chain(&self, first: u32) -> Option<Arc<Vec<u32>>> {
        self.chains.lock().get(&first).cloned()
    }

    pub(crate) fn store_chain(&self, first: u32, chain: Arc<Vec<u32>>) {
        self.chains.lock().insert(first, chain);
    }

    pub(crate) fn invalidate_chain(&self, first: u32) {
        self.chains.lock().remove(&first);
    }

    // ── Directory listings ──────────────────────────────────────────────

    /// Per-path exclusion: concurrent listers of one directory collapse
    /// onto a single underlying read.
    pub(crate) fn listing_lock(&self, norm_path: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.listing_locks
                .lock()
                .entry(norm_path.to_owned())
                .or_default(),
        )
    }

    pub(crate) fn listing(&self, norm_path: &str) -> Option<Arc<Vec<FileEntry>>> {
        self.listings.lock().get(norm_path).cloned()
    }

    pub(crate) fn store_listing(&self, norm_path: String, entries: Arc<Vec<FileEntry>>) {
        self.listings.lock().insert(norm_path, entries);
    }

    pub(crate) fn invalidate_listing(&self, norm_path: &str) {
        self.listings.lock().remove(norm_path);
    }

    // ── Free space ──────────────────────────────────────────────────────

    pub(crate) fn free_clusters(&self) -> Option<u64> {
        *self.free_clusters.lock()
    }

    pub(crate) fn set_free_clusters(&self, count: u64) {
        *self.free_clusters.lock() = Some(count);
    }

    /// Adjust the cached figure after an allocation (negative) or a chain
    /// free (positive). A figure that was never computed stays unset.
    pub(crate) fn adjust_free_clusters(&self, delta: i64) {
        let mut slot = self.free_clusters.lock();
        if let Some(count) = *slot {
            *slot = Some(count.saturating_add_signed(delta));
        }
    }

    pub(crate) fn invalidate_free_clusters(&self) {
        *self.free_clusters.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_cache_evicts_in_bulk_on_overflow() {
        let mut cache = FatSectorCache::new();
        for i in 0..=(FAT_CACHE_CAP as u64) {
            cache.insert(i, vec![i as u8]);
        }
        assert!(cache.map.len() <= FAT_CACHE_CAP);
        // The oldest entries went first.
        assert!(cache.get(0).is_none());
        assert!(cache.get(FAT_CACHE_CAP as u64).is_some());
    }

    #[test]
    fn reinserting_does_not_duplicate_order_entries() {
        let mut cache = FatSectorCache::new();
        for _ in 0..10 {
            cache.insert(7, vec![1, 2, 3]);
        }
        assert_eq!(cache.order.len(), 1);
    }

    #[test]
    fn free_cluster_adjustments_only_touch_computed_figures() {
        let caches = Caches::new();
        caches.adjust_free_clusters(-5);
        assert_eq!(caches.free_clusters(), None);

        caches.set_free_clusters(100);
        caches.adjust_free_clusters(-5);
        caches.adjust_free_clusters(2);
        assert_eq!(caches.free_clusters(), Some(97));
    }

    #[test]
    fn listing_cache_round_trip_and_invalidation() {
        let caches = Caches::new();
        let entries = Arc::new(vec![]);
        caches.store_listing("/docs".to_owned(), Arc::clone(&entries));
        assert!(caches.listing("/docs").is_some());
        caches.invalidate_listing("/docs");
        assert!(caches.listing("/docs").is_none());
    }
}
