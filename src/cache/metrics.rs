//! Loader Metrics Collection
//!
//! Engine-wide counters for tier hits, physical fetches and degradations.
//! Tier-local occupancy lives in each tier's `stats()`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Loader metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,

    // Disk tier
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    disk_fallbacks: AtomicU64,
    disk_recoveries: AtomicU64,

    // Network tier
    network_fetches: AtomicU64,
    coalesced_joins: AtomicU64,
    history_redirects: AtomicU64,
    low_speed_aborts: AtomicU64,
    network_failures: AtomicU64,
    bytes_downloaded: AtomicU64,

    // Delivery
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_miss(&self) {
        self.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A load that bypassed the disk tier and buffered in memory
    pub fn record_disk_fallback(&self) {
        self.disk_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A recovery write that succeeded while the disk was unhealthy
    pub fn record_disk_recovery(&self) {
        self.disk_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// One physical network transfer started
    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// A task joined an in-flight fetch instead of starting one
    pub fn record_coalesced(&self) {
        self.coalesced_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_redirect(&self) {
        self.history_redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_low_speed_abort(&self) {
        self.low_speed_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_failure(&self) {
        self.network_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    /// Physical network transfers started so far
    pub fn network_fetches(&self) -> u64 {
        self.network_fetches.load(Ordering::Relaxed)
    }

    /// Memory hit ratio
    pub fn memory_hit_ratio(&self) -> f64 {
        ratio(
            self.memory_hits.load(Ordering::Relaxed),
            self.memory_misses.load(Ordering::Relaxed),
        )
    }

    /// Disk hit ratio among lookups that reached the disk tier
    pub fn disk_hit_ratio(&self) -> f64 {
        ratio(
            self.disk_hits.load(Ordering::Relaxed),
            self.disk_misses.load(Ordering::Relaxed),
        )
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.disk_misses.load(Ordering::Relaxed),
            disk_fallbacks: self.disk_fallbacks.load(Ordering::Relaxed),
            disk_recoveries: self.disk_recoveries.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            coalesced_joins: self.coalesced_joins.load(Ordering::Relaxed),
            history_redirects: self.history_redirects.load(Ordering::Relaxed),
            low_speed_aborts: self.low_speed_aborts.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Snapshot of loader metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub disk_fallbacks: u64,
    pub disk_recoveries: u64,
    pub network_fetches: u64,
    pub coalesced_joins: u64,
    pub history_redirects: u64,
    pub low_speed_aborts: u64,
    pub network_failures: u64,
    pub bytes_downloaded: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory {}/{} hit, disk {}/{} hit, {} fetches ({} coalesced, {} history redirects), \
             {} low-speed aborts, {} disk fallbacks, {} bytes downloaded, \
             {} ok / {} failed / {} canceled",
            self.memory_hits,
            self.memory_hits + self.memory_misses,
            self.disk_hits,
            self.disk_hits + self.disk_misses,
            self.network_fetches,
            self.coalesced_joins,
            self.history_redirects,
            self.low_speed_aborts,
            self.disk_fallbacks,
            self.bytes_downloaded,
            self.succeeded,
            self.failed,
            self.canceled
        )
    }
}
