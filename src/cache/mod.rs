//! Two-tier derivative cache.
//!
//! - `memory` - bounded LRU tier of display handles
//! - `durable` - restart-surviving tier behind the `DurableStore` trait
//! - `disk` / `sqlite` - concrete durable stores
//! - `handle` - display handles and their release hook
//!
//! The cache owns every handle it mints. A handle leaves the cache through
//! exactly one door: it is passed to the [`HandleReleaser`], once.

pub mod disk;
pub mod durable;
pub mod handle;
pub mod memory;
pub mod sqlite;

pub use disk::DiskStore;
pub use durable::{DurableStore, DurableTier, MemoryStore, StoredDerivative};
pub use handle::{DisplayHandle, DropReleaser, HandleId, HandleReleaser};
pub use memory::MemoryTier;
pub use sqlite::SqliteStore;

use crate::state::{AssetId, EditFingerprint};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Counters for both tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub evictions: u64,
    pub resident: usize,
    pub capacity: usize,
}

struct MemoryState {
    tier: MemoryTier,
    stats: CacheStats,
}

/// Memory tier + durable tier with write-through and read-through.
pub struct DerivativeCache {
    memory: Mutex<MemoryState>,
    durable: DurableTier,
    releaser: Arc<dyn HandleReleaser>,
    next_handle: AtomicU64,
}

impl DerivativeCache {
    /// Build a cache holding at most `capacity` handles in memory.
    ///
    /// Must be called from within a tokio runtime (the durable tier runs as a task).
    pub fn new(
        capacity: usize,
        store: Arc<dyn DurableStore>,
        releaser: Arc<dyn HandleReleaser>,
    ) -> Self {
        Self {
            memory: Mutex::new(MemoryState {
                tier: MemoryTier::new(capacity),
                stats: CacheStats {
                    capacity,
                    ..CacheStats::default()
                },
            }),
            durable: DurableTier::spawn(store),
            releaser,
            next_handle: AtomicU64::new(1),
        }
    }

    fn memory(&self) -> MutexGuard<'_, MemoryState> {
        // The memory state stays consistent even if a holder panicked:
        // every mutation completes before any call that could unwind.
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mint(&self, asset: &AssetId, bytes: Vec<u8>) -> DisplayHandle {
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        DisplayHandle::new(id, asset.clone(), Arc::from(bytes))
    }

    fn release_all(&self, handles: Vec<DisplayHandle>) {
        for handle in handles {
            trace!(asset = %handle.asset(), handle = %handle.id(), "releasing display handle");
            self.releaser.release(handle);
        }
    }

    /// Hand a handle back to its external owner.
    ///
    /// Only for handles previously obtained through [`detach`](Self::detach).
    pub fn release(&self, handle: DisplayHandle) {
        self.release_all(vec![handle]);
    }

    /// Memory-tier lookup for a specific edit identity.
    ///
    /// A resident derivative rendered with different edits counts as a miss.
    pub fn lookup(&self, asset: &AssetId, edit: Option<EditFingerprint>) -> Option<DisplayHandle> {
        let mut memory = self.memory();
        let found = match memory.tier.get(asset) {
            Some(entry) if entry.edit == edit => Some(entry.handle.clone()),
            _ => None,
        };
        if found.is_some() {
            memory.stats.memory_hits += 1;
        } else {
            memory.stats.memory_misses += 1;
        }
        found
    }

    /// Memory tier first, then the durable tier (promoting into memory).
    pub async fn get(&self, asset: &AssetId) -> Option<DisplayHandle> {
        {
            let mut memory = self.memory();
            if let Some(entry) = memory.tier.get(asset) {
                let handle = entry.handle.clone();
                memory.stats.memory_hits += 1;
                return Some(handle);
            }
            memory.stats.memory_misses += 1;
        }

        let stored = self.durable.get(asset.as_str()).await;
        self.record_durable(stored.is_some());
        let stored = stored?;
        Some(self.promote(asset, stored.bytes, stored.edit))
    }

    /// Durable-tier read for a specific edit identity, without promotion.
    pub async fn load_durable(
        &self,
        asset: &AssetId,
        edit: Option<EditFingerprint>,
    ) -> Option<Vec<u8>> {
        let bytes = self
            .durable
            .get(asset.as_str())
            .await
            .filter(|stored| stored.edit == edit)
            .map(|stored| stored.bytes);
        self.record_durable(bytes.is_some());
        bytes
    }

    fn record_durable(&self, hit: bool) {
        let mut memory = self.memory();
        if hit {
            memory.stats.durable_hits += 1;
        } else {
            memory.stats.durable_misses += 1;
        }
    }

    /// Insert into memory only; for bytes that came from the durable tier.
    pub fn promote(
        &self,
        asset: &AssetId,
        bytes: Vec<u8>,
        edit: Option<EditFingerprint>,
    ) -> DisplayHandle {
        let handle = self.mint(asset, bytes);
        let released = {
            let mut memory = self.memory();
            let released = memory.tier.insert(asset.clone(), handle.clone(), edit);
            // A replaced entry for the same asset is not an eviction
            let evicted = released.iter().filter(|h| h.asset() != asset).count();
            memory.stats.evictions += evicted as u64;
            memory.stats.resident = memory.tier.len();
            released
        };
        self.release_all(released);
        handle
    }

    /// Write through to the durable tier and insert into memory.
    pub fn put(
        &self,
        asset: &AssetId,
        bytes: Vec<u8>,
        edit: Option<EditFingerprint>,
    ) -> DisplayHandle {
        self.durable.set(asset.as_str(), edit, &bytes);
        self.promote(asset, bytes, edit)
    }

    /// Drop an asset from both tiers, releasing its handle.
    pub fn invalidate(&self, asset: &AssetId) {
        if let Some(handle) = self.detach(asset) {
            self.release(handle);
        }
    }

    /// Drop an asset from both tiers, handing its memory handle to the caller
    /// instead of releasing it. The caller must eventually pass it to
    /// [`release`](Self::release).
    pub fn detach(&self, asset: &AssetId) -> Option<DisplayHandle> {
        self.durable.delete(asset.as_str());
        let mut memory = self.memory();
        let handle = memory.tier.remove(asset);
        memory.stats.resident = memory.tier.len();
        handle
    }

    /// Release every memory handle and empty both tiers.
    pub fn clear(&self) {
        self.durable.clear();
        let drained = {
            let mut memory = self.memory();
            memory.stats.resident = 0;
            memory.tier.drain()
        };
        self.release_all(drained);
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.memory().tier.contains(asset)
    }

    pub fn len(&self) -> usize {
        self.memory().tier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.memory().tier.capacity()
    }

    pub fn stats(&self) -> CacheStats {
        self.memory().stats
    }

    /// Wait for queued durable writes and deletes to reach the store.
    pub async fn flush(&self) {
        self.durable.flush().await;
    }
}

impl std::fmt::Debug for DerivativeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivativeCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::state::EditParams;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingReleaser {
        released: Mutex<Vec<(AssetId, HandleId)>>,
    }

    impl RecordingReleaser {
        fn released(&self) -> Vec<(AssetId, HandleId)> {
            self.released.lock().unwrap().clone()
        }
    }

    impl HandleReleaser for RecordingReleaser {
        fn release(&self, handle: DisplayHandle) {
            self.released
                .lock()
                .unwrap()
                .push((handle.asset().clone(), handle.id()));
        }
    }

    /// Store that fails every operation.
    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        async fn set(&self, _key: &str, _bytes: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        async fn clear(&self) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn cache_with(capacity: usize) -> (DerivativeCache, MemoryStore, Arc<RecordingReleaser>) {
        let store = MemoryStore::new();
        let releaser = Arc::new(RecordingReleaser::default());
        let cache = DerivativeCache::new(capacity, Arc::new(store.clone()), releaser.clone());
        (cache, store, releaser)
    }

    fn asset(name: &str) -> AssetId {
        AssetId::from(name)
    }

    #[tokio::test]
    async fn test_lru_scenario_releases_least_recent_once() {
        let (cache, _store, releaser) = cache_with(2);

        cache.put(&asset("a"), b"A".to_vec(), None);
        let b = cache.put(&asset("b"), b"B".to_vec(), None);
        assert!(cache.get(&asset("a")).await.is_some());
        cache.put(&asset("c"), b"C".to_vec(), None);

        assert!(cache.contains(&asset("a")));
        assert!(cache.contains(&asset("c")));
        assert!(!cache.contains(&asset("b")));
        assert_eq!(releaser.released(), vec![(asset("b"), b.id())]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_invariant_and_single_release() {
        let (cache, _store, releaser) = cache_with(3);
        let mut minted = Vec::new();

        for i in 0..25 {
            let name = format!("asset-{}", i % 7);
            minted.push(cache.put(&asset(&name), vec![i as u8], None).id());
            assert!(cache.len() <= 3);
        }

        let released = releaser.released();
        let mut released_ids: Vec<HandleId> = released.iter().map(|(_, id)| *id).collect();
        released_ids.sort();
        released_ids.dedup();
        assert_eq!(released_ids.len(), released.len(), "a handle was released twice");
        // Everything minted is either resident or released
        assert_eq!(released.len() + cache.len(), minted.len());
    }

    #[tokio::test]
    async fn test_round_trip_and_invalidate() {
        let (cache, store, releaser) = cache_with(4);

        let handle = cache.put(&asset("a"), b"jpeg bytes".to_vec(), None);
        let fetched = cache.get(&asset("a")).await.unwrap();
        assert_eq!(fetched, handle);
        assert_eq!(fetched.bytes(), b"jpeg bytes");

        cache.invalidate(&asset("a"));
        cache.flush().await;

        assert!(cache.get(&asset("a")).await.is_none());
        assert!(store.is_empty());
        assert_eq!(releaser.released(), vec![(asset("a"), handle.id())]);
    }

    #[tokio::test]
    async fn test_durable_promotion() {
        let store = MemoryStore::new();
        store
            .set("a", &StoredDerivative::encode(None, b"from disk"))
            .await
            .unwrap();
        let cache = DerivativeCache::new(2, Arc::new(store), Arc::new(DropReleaser));
        assert!(cache.is_empty());

        let handle = cache.get(&asset("a")).await.unwrap();

        assert_eq!(handle.bytes(), b"from disk");
        assert!(cache.contains(&asset("a")));
        assert_eq!(cache.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_lookup_respects_edit_identity() {
        let (cache, _store, _releaser) = cache_with(2);
        let edited = EditParams {
            exposure: 1.0,
            ..EditParams::default()
        }
        .fingerprint();

        cache.put(&asset("a"), b"edited".to_vec(), Some(edited));

        assert!(cache.lookup(&asset("a"), None).is_none());
        assert!(cache.lookup(&asset("a"), Some(edited)).is_some());
        assert!(cache.load_durable(&asset("a"), None).await.is_none());
        assert_eq!(
            cache.load_durable(&asset("a"), Some(edited)).await.as_deref(),
            Some(&b"edited"[..])
        );
    }

    #[tokio::test]
    async fn test_storage_failures_degrade_to_misses() {
        let releaser = Arc::new(RecordingReleaser::default());
        let cache = DerivativeCache::new(2, Arc::new(BrokenStore), releaser.clone());

        assert!(cache.get(&asset("a")).await.is_none());

        // The memory tier keeps working when write-through fails
        let handle = cache.put(&asset("a"), b"A".to_vec(), None);
        cache.flush().await;
        assert_eq!(cache.get(&asset("a")).await, Some(handle));
    }

    #[tokio::test]
    async fn test_detach_transfers_ownership() {
        let (cache, _store, releaser) = cache_with(2);
        let handle = cache.put(&asset("a"), b"A".to_vec(), None);

        let detached = cache.detach(&asset("a")).unwrap();
        assert!(!cache.contains(&asset("a")));
        assert!(releaser.released().is_empty());

        cache.release(detached);
        assert_eq!(releaser.released(), vec![(asset("a"), handle.id())]);
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let (cache, store, releaser) = cache_with(4);
        cache.put(&asset("a"), b"A".to_vec(), None);
        cache.put(&asset("b"), b"B".to_vec(), None);

        cache.clear();
        cache.flush().await;

        assert!(cache.is_empty());
        assert!(store.is_empty());
        assert_eq!(releaser.released().len(), 2);
    }
}
