//! Per-asset generation counters.
//!
//! A worker captures the asset's generation when its item is enqueued and
//! may only commit if the generation is unchanged when the work completes.
//! Anything that supersedes outstanding work (an edit, a source change, a
//! cancellation of in-flight work) bumps the counter.

use crate::state::AssetId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct GenerationRegistry {
    generations: HashMap<AssetId, u64>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation, creating the entry at 0 on first use.
    pub fn current(&mut self, asset: &AssetId) -> u64 {
        *self.generations.entry(asset.clone()).or_insert(0)
    }

    /// Value to capture into a queue item at enqueue time.
    pub fn snapshot(&mut self, asset: &AssetId) -> u64 {
        self.current(asset)
    }

    /// Increment by exactly one and return the new generation.
    pub fn bump(&mut self, asset: &AssetId) -> u64 {
        let generation = self.generations.entry(asset.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Whether work captured at `generation` is still current.
    pub fn is_current(&mut self, asset: &AssetId, generation: u64) -> bool {
        self.current(asset) == generation
    }

    /// Forget every asset. Only for whole-folder or catalog clears.
    pub fn clear(&mut self) {
        self.generations.clear();
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_start_at_zero() {
        let mut registry = GenerationRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.current(&"a".into()), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bump_increments_by_one() {
        let mut registry = GenerationRegistry::new();
        let a = AssetId::from("a");

        assert_eq!(registry.bump(&a), 1);
        assert_eq!(registry.bump(&a), 2);
        assert_eq!(registry.snapshot(&a), 2);
        assert_eq!(registry.current(&"b".into()), 0);
    }

    #[test]
    fn test_captured_generation_goes_stale_after_bump() {
        let mut registry = GenerationRegistry::new();
        let a = AssetId::from("a");

        let captured = registry.snapshot(&a);
        assert!(registry.is_current(&a, captured));

        registry.bump(&a);
        assert!(!registry.is_current(&a, captured));
    }

    #[test]
    fn test_clear_resets() {
        let mut registry = GenerationRegistry::new();
        registry.bump(&"a".into());
        registry.clear();
        assert_eq!(registry.current(&"a".into()), 0);
    }
}
