//! In-memory derivative tier with strict LRU eviction.
//!
//! Recency is a logical access tick rather than a wall clock so that two
//! accesses in the same instant still order deterministically.

use super::handle::DisplayHandle;
use crate::state::{AssetId, EditFingerprint};
use std::collections::{BTreeMap, HashMap};

/// Resident derivative.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub handle: DisplayHandle,
    /// Edit identity the derivative was rendered with (`None` = original)
    pub edit: Option<EditFingerprint>,
    last_access: u64,
}

/// Bounded map of display handles.
///
/// Never releases anything itself: every method that drops an entry returns
/// the handle so the owning cache can release it.
#[derive(Debug)]
pub struct MemoryTier {
    entries: HashMap<AssetId, MemoryEntry>,
    /// last access tick -> asset, oldest first
    recency: BTreeMap<u64, AssetId>,
    capacity: usize,
    tick: u64,
}

impl MemoryTier {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "memory tier capacity must be non-zero");
        Self {
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            capacity,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, asset: &AssetId) -> Option<&MemoryEntry> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(asset)?;
        self.recency.remove(&entry.last_access);
        entry.last_access = tick;
        self.recency.insert(tick, asset.clone());
        Some(&*entry)
    }

    /// Look up an entry without touching its recency.
    pub fn peek(&self, asset: &AssetId) -> Option<&MemoryEntry> {
        self.entries.get(asset)
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.entries.contains_key(asset)
    }

    /// Insert or replace an entry as most recently used.
    ///
    /// Returns every handle that left the tier: the replaced handle for the
    /// same asset (if any) and the least recently used entries evicted to stay
    /// within capacity. They are unreachable from the tier when this returns.
    pub fn insert(
        &mut self,
        asset: AssetId,
        handle: DisplayHandle,
        edit: Option<EditFingerprint>,
    ) -> Vec<DisplayHandle> {
        let mut released = Vec::new();
        if let Some(old) = self.remove(&asset) {
            released.push(old);
        }

        while self.entries.len() >= self.capacity {
            match self.pop_lru() {
                Some(evicted) => released.push(evicted),
                None => break,
            }
        }

        let tick = self.next_tick();
        self.recency.insert(tick, asset.clone());
        self.entries.insert(
            asset,
            MemoryEntry {
                handle,
                edit,
                last_access: tick,
            },
        );
        released
    }

    /// Remove an entry, returning its handle.
    pub fn remove(&mut self, asset: &AssetId) -> Option<DisplayHandle> {
        let entry = self.entries.remove(asset)?;
        self.recency.remove(&entry.last_access);
        Some(entry.handle)
    }

    /// Remove everything, returning all handles.
    pub fn drain(&mut self) -> Vec<DisplayHandle> {
        self.recency.clear();
        self.entries.drain().map(|(_, entry)| entry.handle).collect()
    }

    fn pop_lru(&mut self) -> Option<DisplayHandle> {
        let (_, asset) = self.recency.pop_first()?;
        self.entries.remove(&asset).map(|entry| entry.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::handle::HandleId;
    use std::sync::Arc;

    fn handle(id: u64, asset: &str) -> DisplayHandle {
        DisplayHandle::new(HandleId(id), AssetId::from(asset), Arc::from(vec![id as u8]))
    }

    fn ids(handles: &[DisplayHandle]) -> Vec<u64> {
        handles.iter().map(|h| h.id().0).collect()
    }

    #[test]
    fn test_insert_within_capacity_evicts_nothing() {
        let mut tier = MemoryTier::new(2);
        assert!(tier.insert("a".into(), handle(1, "a"), None).is_empty());
        assert!(tier.insert("b".into(), handle(2, "b"), None).is_empty());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut tier = MemoryTier::new(2);
        tier.insert("a".into(), handle(1, "a"), None);
        tier.insert("b".into(), handle(2, "b"), None);
        assert!(tier.get(&"a".into()).is_some());

        let evicted = tier.insert("c".into(), handle(3, "c"), None);

        assert_eq!(ids(&evicted), vec![2]);
        assert!(tier.contains(&"a".into()));
        assert!(tier.contains(&"c".into()));
        assert!(!tier.contains(&"b".into()));
    }

    #[test]
    fn test_peek_does_not_refresh_recency() {
        let mut tier = MemoryTier::new(2);
        tier.insert("a".into(), handle(1, "a"), None);
        tier.insert("b".into(), handle(2, "b"), None);
        assert!(tier.peek(&"a".into()).is_some());

        let evicted = tier.insert("c".into(), handle(3, "c"), None);

        assert_eq!(ids(&evicted), vec![1]);
    }

    #[test]
    fn test_replace_returns_old_handle() {
        let mut tier = MemoryTier::new(2);
        tier.insert("a".into(), handle(1, "a"), None);

        let released = tier.insert("a".into(), handle(2, "a"), None);

        assert_eq!(ids(&released), vec![1]);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.peek(&"a".into()).unwrap().handle.id(), HandleId(2));
    }

    #[test]
    fn test_capacity_holds_for_many_inserts() {
        let mut tier = MemoryTier::new(3);
        let mut evicted = Vec::new();
        for i in 0..20u64 {
            let name = format!("asset-{i}");
            evicted.extend(tier.insert(name.as_str().into(), handle(i, &name), None));
            assert!(tier.len() <= 3);
        }
        assert_eq!(evicted.len(), 17);
        assert_eq!(ids(&evicted), (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_and_drain() {
        let mut tier = MemoryTier::new(4);
        tier.insert("a".into(), handle(1, "a"), None);
        tier.insert("b".into(), handle(2, "b"), None);

        assert_eq!(tier.remove(&"a".into()).map(|h| h.id()), Some(HandleId(1)));
        assert!(tier.remove(&"a".into()).is_none());

        let drained = tier.drain();
        assert_eq!(ids(&drained), vec![2]);
        assert!(tier.is_empty());
    }
}
