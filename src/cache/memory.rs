//! Memory Tier - decoded resources held in RAM
//!
//! Byte-budgeted LRU of decoded resources with a quarantine area for entries
//! that were evicted while a caller still displays them.
//!
//! # Design
//!
//! ```text
//!   put ──► ┌──────────────── LRU (budget) ────────────────┐
//!           │ MRU  e5  e4  e3  e2  e1  LRU                  │
//!           └──────────────────────────────┬───────────────┘
//!                          evict           │
//!                 in_use = false ◄─────────┴────────► in_use = true
//!                 release() now                      quarantine (own budget)
//!                                                        │ mark_unused
//!                                                        ▼
//!                                                    release() now
//! ```
//!
//! - One `parking_lot::Mutex` guards the LRU and the quarantine; resources are
//!   released after the guard is dropped.
//! - Quarantine overflow is a process-wide fault, not a per-task one: it is
//!   logged, broadcast to alert subscribers, and returned from the call that
//!   caused it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::entry::{CacheKey, MemoryEntry};
use crate::decode::Resource;
use crate::error::{Error, Result};

/// Default memory budget (32MB)
pub const DEFAULT_MEMORY_BUDGET: u64 = 32 * 1024 * 1024;

/// Default quarantine budget (16MB)
pub const DEFAULT_QUARANTINE_BUDGET: u64 = 16 * 1024 * 1024;

const ALERT_CHANNEL_CAPACITY: usize = 16;

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum resident bytes in the LRU
    pub budget: u64,
    /// Maximum bytes held in quarantine
    pub quarantine_budget: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget: DEFAULT_MEMORY_BUDGET,
            quarantine_budget: DEFAULT_QUARANTINE_BUDGET,
        }
    }
}

/// Quarantine overflow notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityAlert {
    pub quarantined: u64,
    pub budget: u64,
}

/// Memory tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub quarantined_entries: usize,
    pub quarantined_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub quarantines: u64,
}

struct MemoryState {
    lru: LruCache<CacheKey, MemoryEntry>,
    resident: u64,
    quarantine: HashMap<CacheKey, Vec<MemoryEntry>>,
    quarantined: u64,
}

impl MemoryState {
    /// Free an unused entry, or park an in-use one in quarantine
    fn retire(&mut self, entry: MemoryEntry, freed: &mut Vec<Arc<dyn Resource>>) -> bool {
        if entry.in_use {
            self.quarantined += entry.size;
            self.quarantine
                .entry(entry.key.clone())
                .or_default()
                .push(entry);
            true
        } else {
            freed.push(entry.resource);
            false
        }
    }
}

/// Memory Tier - byte-budgeted LRU with quarantine
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    config: MemoryConfig,
    alerts: broadcast::Sender<CapacityAlert>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    quarantines: AtomicU64,
}

impl MemoryTier {
    /// Create a memory tier with default budgets
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a memory tier with custom budgets
    pub fn with_config(config: MemoryConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState {
                lru: LruCache::unbounded(),
                resident: 0,
                quarantine: HashMap::new(),
                quarantined: 0,
            }),
            config,
            alerts,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            quarantines: AtomicU64::new(0),
        }
    }

    /// Subscribe to quarantine overflow alerts
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityAlert> {
        self.alerts.subscribe()
    }

    /// Insert a resource that is about to be handed to a caller
    ///
    /// The entry starts in use. Returns `Ok(false)` when the resource alone is
    /// larger than the budget and was therefore not cached.
    pub fn put(&self, key: CacheKey, resource: Arc<dyn Resource>) -> Result<bool> {
        let entry = MemoryEntry::new(key, resource, true);
        if entry.size > self.config.budget {
            debug!(
                key = %entry.key.short(),
                size = entry.size,
                budget = self.config.budget,
                "Resource larger than memory budget, not cached"
            );
            return Ok(false);
        }

        let mut freed = Vec::new();
        let overflow = {
            let mut state = self.state.lock();
            state.resident += entry.size;
            if let Some(previous) = state.lru.put(entry.key.clone(), entry) {
                state.resident -= previous.size;
                if state.retire(previous, &mut freed) {
                    self.quarantines.fetch_add(1, Ordering::Relaxed);
                }
            }

            while state.resident > self.config.budget {
                let Some((_, victim)) = state.lru.pop_lru() else {
                    break;
                };
                state.resident -= victim.size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if state.retire(victim, &mut freed) {
                    self.quarantines.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.check_quarantine(&state)
        };

        release_all(freed);
        overflow.map(|_| true)
    }

    /// Look up a resident resource and mark it in use
    ///
    /// Quarantined entries are never returned.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<dyn Resource>> {
        let mut state = self.state.lock();
        match state.lru.get_mut(key) {
            Some(entry) => {
                entry.in_use = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.resource.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a resident (non-quarantined) entry exists, without touching
    /// recency or the in-use flag
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().lru.contains(key)
    }

    /// Clear the in-use flag; quarantined entries for the key are freed now
    ///
    /// Returns true if anything changed.
    pub fn mark_unused(&self, key: &CacheKey) -> bool {
        let mut freed = Vec::new();
        let changed = {
            let mut state = self.state.lock();
            let mut changed = false;
            if let Some(entry) = state.lru.peek_mut(key) {
                changed = entry.in_use;
                entry.in_use = false;
            }
            if let Some(parked) = state.quarantine.remove(key) {
                for entry in parked {
                    state.quarantined -= entry.size;
                    freed.push(entry.resource);
                }
                changed = true;
            }
            changed
        };

        if !freed.is_empty() {
            debug!(key = %key.short(), count = freed.len(), "Freed quarantined resources");
        }
        release_all(freed);
        changed
    }

    /// Remove a resident entry. In-use entries move to quarantine.
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut freed = Vec::new();
        let result = {
            let mut state = self.state.lock();
            match state.lru.pop(key) {
                Some(entry) => {
                    state.resident -= entry.size;
                    if state.retire(entry, &mut freed) {
                        self.quarantines.fetch_add(1, Ordering::Relaxed);
                    }
                    self.check_quarantine(&state).map(|_| true)
                }
                None => Ok(false),
            }
        };
        release_all(freed);
        result
    }

    /// Remove every resident entry. In-use entries move to quarantine.
    pub fn remove_all(&self) -> Result<usize> {
        let mut freed = Vec::new();
        let (count, result) = {
            let mut state = self.state.lock();
            let mut count = 0;
            while let Some((_, entry)) = state.lru.pop_lru() {
                state.resident -= entry.size;
                if state.retire(entry, &mut freed) {
                    self.quarantines.fetch_add(1, Ordering::Relaxed);
                }
                count += 1;
            }
            (count, self.check_quarantine(&state))
        };
        release_all(freed);
        result.map(|_| count)
    }

    fn check_quarantine(&self, state: &MemoryState) -> Result<()> {
        if state.quarantined <= self.config.quarantine_budget {
            return Ok(());
        }
        error!(
            quarantined = state.quarantined,
            budget = self.config.quarantine_budget,
            entries = state.quarantine.len(),
            "Quarantine overflow: resources are not being released by callers"
        );
        // no subscribers is fine; the log line above is the record
        let _ = self.alerts.send(CapacityAlert {
            quarantined: state.quarantined,
            budget: self.config.quarantine_budget,
        });
        Err(Error::CapacityExceeded {
            quarantined: state.quarantined,
            budget: self.config.quarantine_budget,
        })
    }

    /// Snapshot of counters and occupancy
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.lru.len(),
            resident_bytes: state.resident,
            quarantined_entries: state.quarantine.values().map(Vec::len).sum(),
            quarantined_bytes: state.quarantined,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            quarantines: self.quarantines.load(Ordering::Relaxed),
        }
    }

    /// One-line human summary
    pub fn report(&self) -> String {
        let stats = self.stats();
        format!(
            "memory: {} entries, {}/{} bytes resident, {} quarantined ({}/{} bytes), hit rate {:.1}%",
            stats.entries,
            stats.resident_bytes,
            self.config.budget,
            stats.quarantined_entries,
            stats.quarantined_bytes,
            self.config.quarantine_budget,
            self.hit_rate() * 100.0
        )
    }

    /// Hit rate over all `get` calls
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

fn release_all(freed: Vec<Arc<dyn Resource>>) {
    for resource in freed {
        resource.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Blob;
    use crate::request::LoadParams;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(&format!("http://host/{}", name), &LoadParams::default()).unwrap()
    }

    fn blob(size: usize) -> Arc<Blob> {
        Arc::new(Blob::new(Bytes::from(vec![7u8; size])))
    }

    fn tier(budget: u64, quarantine_budget: u64) -> MemoryTier {
        MemoryTier::with_config(MemoryConfig {
            budget,
            quarantine_budget,
        })
    }

    #[test]
    fn test_put_get() {
        let tier = tier(100, 100);
        let a = key("a");

        assert!(tier.put(a.clone(), blob(10)).unwrap());
        assert!(tier.get(&a).is_some());
        assert!(tier.get(&key("missing")).is_none());

        let stats = tier.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.resident_bytes, 10);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_frees_unused() {
        let tier = tier(20, 100);
        let (a, b, c) = (key("a"), key("b"), key("c"));
        let blob_a = blob(10);

        tier.put(a.clone(), blob_a.clone()).unwrap();
        tier.put(b.clone(), blob(10)).unwrap();
        tier.mark_unused(&a);
        tier.mark_unused(&b);

        // touch a so b becomes least recently used
        tier.get(&a);
        tier.mark_unused(&a);
        tier.put(c.clone(), blob(10)).unwrap();

        assert!(tier.contains(&a));
        assert!(!tier.contains(&b));
        assert!(tier.contains(&c));
        assert!(!blob_a.is_released());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_in_use_eviction_goes_to_quarantine() {
        let tier = tier(10, 100);
        let (a, b) = (key("a"), key("b"));
        let blob_a = blob(10);

        tier.put(a.clone(), blob_a.clone()).unwrap();
        tier.put(b.clone(), blob(10)).unwrap();

        let stats = tier.stats();
        assert_eq!(stats.quarantined_entries, 1);
        assert_eq!(stats.quarantined_bytes, 10);
        assert!(!blob_a.is_released());
        // quarantined entries are not retrievable
        assert!(tier.get(&a).is_none());

        assert!(tier.mark_unused(&a));
        assert!(blob_a.is_released());
        assert_eq!(tier.stats().quarantined_bytes, 0);
        assert!(tier.get(&a).is_none());
    }

    #[test]
    fn test_quarantine_overflow_is_reported() {
        let tier = tier(10, 15);
        let mut alerts = tier.subscribe();

        tier.put(key("a"), blob(10)).unwrap();
        tier.put(key("b"), blob(10)).unwrap();
        let result = tier.put(key("c"), blob(10));

        assert!(matches!(
            result,
            Err(Error::CapacityExceeded {
                quarantined: 20,
                budget: 15
            })
        ));
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.quarantined, 20);
    }

    #[test]
    fn test_oversized_resource_not_cached() {
        let tier = tier(10, 10);
        let a = key("a");

        assert!(!tier.put(a.clone(), blob(11)).unwrap());
        assert!(!tier.contains(&a));
        assert_eq!(tier.stats().resident_bytes, 0);
    }

    #[test]
    fn test_replace_existing_key() {
        let tier = tier(100, 100);
        let a = key("a");
        let old = blob(10);

        tier.put(a.clone(), old.clone()).unwrap();
        tier.mark_unused(&a);
        tier.put(a.clone(), blob(30)).unwrap();

        assert!(old.is_released());
        assert_eq!(tier.stats().resident_bytes, 30);
        assert_eq!(tier.stats().entries, 1);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let tier = tier(100, 100);
        let (a, b, c) = (key("a"), key("b"), key("c"));
        let blob_a = blob(10);
        let blob_b = blob(10);

        tier.put(a.clone(), blob_a.clone()).unwrap();
        tier.put(b.clone(), blob_b.clone()).unwrap();
        tier.put(c.clone(), blob(10)).unwrap();
        tier.mark_unused(&a);
        tier.mark_unused(&c);

        assert!(tier.remove(&a).unwrap());
        assert!(blob_a.is_released());
        assert!(!tier.remove(&a).unwrap());

        assert_eq!(tier.remove_all().unwrap(), 2);
        let stats = tier.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.resident_bytes, 0);
        // b was still displayed
        assert_eq!(stats.quarantined_bytes, 10);
        assert!(!blob_b.is_released());
    }

    #[test]
    fn test_report() {
        let tier = tier(100, 50);
        tier.put(key("a"), blob(10)).unwrap();
        let report = tier.report();
        assert!(report.contains("1 entries"));
        assert!(report.contains("10/100 bytes"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Resident plus quarantined bytes never exceed both budgets combined
        /// unless the overflow was reported.
        #[test]
        fn prop_eviction_invariant(
            ops in prop::collection::vec((0usize..12, 1usize..40, any::<bool>()), 1..80)
        ) {
            let budget = 100;
            let quarantine_budget = 60;
            let tier = tier(budget, quarantine_budget);

            for (id, size, release) in ops {
                let k = key(&id.to_string());
                let result = tier.put(k.clone(), blob(size));
                if release {
                    tier.mark_unused(&k);
                }
                let stats = tier.stats();
                prop_assert!(stats.resident_bytes <= budget);
                if result.is_ok() {
                    prop_assert!(
                        stats.resident_bytes + stats.quarantined_bytes
                            <= budget + quarantine_budget
                    );
                }
            }
        }
    }
}
