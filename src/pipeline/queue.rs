//! Bounded priority queue of pending derivative requests.
//!
//! Items are ordered by `(priority, sequence)`: strict priority across
//! levels, FIFO by insertion sequence within a level. There is at most one
//! item per asset; re-enqueuing updates it in place and keeps its sequence.

use super::source::ByteProvider;
use crate::state::{AssetId, EditParams, Priority};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default hard cap on pending items
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// A pending request.
#[derive(Clone)]
pub struct QueueItem {
    pub asset: AssetId,
    pub priority: Priority,
    /// Generation of the asset when the request was (last) enqueued
    pub generation: u64,
    /// `None` renders the original derivative
    pub edit: Option<EditParams>,
    pub provider: Arc<dyn ByteProvider>,
    sequence: u64,
}

impl QueueItem {
    pub fn new(
        asset: AssetId,
        priority: Priority,
        generation: u64,
        provider: Arc<dyn ByteProvider>,
        edit: Option<EditParams>,
    ) -> Self {
        Self {
            asset,
            priority,
            generation,
            edit,
            provider,
            sequence: 0,
        }
    }

    /// Insertion order, assigned by the queue
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn order_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("asset", &self.asset)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("generation", &self.generation)
            .field("edited", &self.edit.is_some())
            .finish()
    }
}

/// Result of a successful enqueue.
#[derive(Debug)]
pub enum Enqueued {
    /// New item; `evicted` is the worst pending item dropped to make room
    Inserted { evicted: Option<QueueItem> },
    /// Existing item for the same asset updated in place
    Updated,
}

/// The queue is full and the incoming item would be the worst one in it.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("priority queue full ({capacity} items), rejected {asset}")]
pub struct QueueFull {
    pub asset: AssetId,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct PriorityQueue {
    items: HashMap<AssetId, QueueItem>,
    order: BTreeMap<(Priority, u64), AssetId>,
    capacity: usize,
    next_sequence: u64,
}

impl PriorityQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            items: HashMap::new(),
            order: BTreeMap::new(),
            capacity,
            next_sequence: 0,
        }
    }

    /// Insert a new item, or update the pending item for the same asset.
    ///
    /// An update replaces priority, generation, edits and provider but keeps
    /// the original sequence, also when the item is demoted.
    ///
    /// When the queue is full, the worst item (highest priority value, then
    /// newest) is evicted to make room. `Visible` items are never evicted; if
    /// the incoming item would itself be the worst, it is rejected instead.
    pub fn enqueue_or_update(&mut self, mut item: QueueItem) -> Result<Enqueued, QueueFull> {
        if let Some(existing) = self.items.get_mut(&item.asset) {
            self.order.remove(&existing.order_key());
            item.sequence = existing.sequence;
            self.order.insert(item.order_key(), item.asset.clone());
            *existing = item;
            return Ok(Enqueued::Updated);
        }

        let mut evicted = None;
        if self.items.len() >= self.capacity {
            let worst_priority = self
                .order
                .last_key_value()
                .map(|(&(priority, _), _)| priority)
                .unwrap_or(Priority::Visible);
            // The incoming item is newer than everything pending, so at an
            // equal or worse priority it is the worst candidate itself.
            if item.priority >= worst_priority {
                return Err(QueueFull {
                    asset: item.asset,
                    capacity: self.capacity,
                });
            }
            evicted = self.pop_worst();
        }

        item.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.order.insert(item.order_key(), item.asset.clone());
        self.items.insert(item.asset.clone(), item);
        Ok(Enqueued::Inserted { evicted })
    }

    /// Remove and return the item with the lowest `(priority, sequence)`.
    pub fn dequeue_highest(&mut self) -> Option<QueueItem> {
        let (_, asset) = self.order.pop_first()?;
        self.items.remove(&asset)
    }

    fn pop_worst(&mut self) -> Option<QueueItem> {
        let (_, asset) = self.order.pop_last()?;
        self.items.remove(&asset)
    }

    /// Change the priority of a pending item. Returns false if not pending.
    pub fn update_priority(&mut self, asset: &AssetId, priority: Priority) -> bool {
        let Some(item) = self.items.get_mut(asset) else {
            return false;
        };
        if item.priority != priority {
            self.order.remove(&item.order_key());
            item.priority = priority;
            self.order.insert(item.order_key(), asset.clone());
        }
        true
    }

    pub fn remove(&mut self, asset: &AssetId) -> Option<QueueItem> {
        let item = self.items.remove(asset)?;
        self.order.remove(&item.order_key());
        Some(item)
    }

    pub fn peek(&self, asset: &AssetId) -> Option<&QueueItem> {
        self.items.get(asset)
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.items.contains_key(asset)
    }

    /// Remove every item, in dequeue order.
    pub fn drain(&mut self) -> Vec<QueueItem> {
        let order = std::mem::take(&mut self.order);
        let mut drained = Vec::with_capacity(order.len());
        for (_, asset) in order {
            if let Some(item) = self.items.remove(&asset) {
                drained.push(item);
            }
        }
        drained
    }

    /// Pending items per priority level, in `Priority::ALL` order.
    pub fn depth_by_priority(&self) -> [usize; 4] {
        let mut depth = [0; 4];
        for &(priority, _) in self.order.keys() {
            depth[priority as usize] += 1;
        }
        depth
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
