//! History Ring
//!
//! Fixed-capacity record of keys whose network load recently succeeded. A hit
//! hints that the disk write has landed, so the network tier can send the
//! task back to disk instead of fetching again. Only a hint, never a cache.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::entry::CacheKey;

/// Default number of remembered keys
pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

struct Ring {
    slots: Vec<Option<CacheKey>>,
    next: usize,
    members: HashSet<CacheKey>,
}

/// Circular buffer of recently succeeded keys
pub struct HistoryRing {
    ring: Mutex<Ring>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; capacity],
                next: 0,
                members: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Remember a success, overwriting the oldest slot
    pub fn put(&self, key: CacheKey) {
        let mut ring = self.ring.lock();
        if ring.members.contains(&key) {
            return;
        }
        let slot = ring.next;
        if let Some(evicted) = ring.slots[slot].take() {
            ring.members.remove(&evicted);
        }
        ring.members.insert(key.clone());
        ring.slots[slot] = Some(key);
        ring.next = (slot + 1) % ring.slots.len();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.ring.lock().members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.members.clear();
        ring.next = 0;
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
