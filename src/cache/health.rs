//! Disk Health Flag
//!
//! Shared handle injected into the disk tier and the network tier. A write
//! failure flips it to unhealthy; the next successful commit flips it back.
//! While unhealthy, recovery writes are rate-limited by [`DiskHealth::should_probe`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug)]
struct HealthState {
    healthy: AtomicBool,
    failures: AtomicU64,
    recoveries: AtomicU64,
    last_probe: Mutex<Option<Instant>>,
    probe_interval: Duration,
}

/// Cloneable disk health flag
#[derive(Debug, Clone)]
pub struct DiskHealth {
    inner: Arc<HealthState>,
}

impl DiskHealth {
    /// Healthy flag with the given recovery probe interval
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            inner: Arc::new(HealthState {
                healthy: AtomicBool::new(true),
                failures: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
                last_probe: Mutex::new(None),
                probe_interval,
            }),
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// Record a disk failure
    pub fn mark_unhealthy(&self, reason: &str) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_probe.lock() = Some(Instant::now());
        if self.inner.healthy.swap(false, Ordering::AcqRel) {
            warn!(reason, "Disk cache marked unhealthy, buffering loads in memory");
        }
    }

    /// Record a successful commit
    pub fn mark_healthy(&self) {
        if !self.inner.healthy.swap(true, Ordering::AcqRel) {
            self.inner.recoveries.fetch_add(1, Ordering::Relaxed);
            info!("Disk cache recovered");
        }
    }

    /// Whether an unhealthy disk should be retried now. Claims the probe slot
    /// when it returns true.
    pub fn should_probe(&self) -> bool {
        if self.is_healthy() {
            return true;
        }
        let mut last = self.inner.last_probe.lock();
        match *last {
            Some(at) if at.elapsed() < self.inner.probe_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    pub fn recoveries(&self) -> u64 {
        self.inner.recoveries.load(Ordering::Relaxed)
    }
}

impl Default for DiskHealth {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_and_recover() {
        let health = DiskHealth::new(Duration::ZERO);
        let shared = health.clone();
        assert!(health.is_healthy());

        health.mark_unhealthy("enospc");
        assert!(!shared.is_healthy());
        assert_eq!(shared.failures(), 1);

        shared.mark_healthy();
        assert!(health.is_healthy());
        assert_eq!(health.recoveries(), 1);

        // already healthy: no extra recovery counted
        health.mark_healthy();
        assert_eq!(health.recoveries(), 1);
    }

    #[test]
    fn test_probe_rate_limit() {
        let health = DiskHealth::new(Duration::from_secs(3600));
        assert!(health.should_probe());

        health.mark_unhealthy("eio");
        assert!(!health.should_probe());

        let eager = DiskHealth::new(Duration::ZERO);
        eager.mark_unhealthy("eio");
        assert!(eager.should_probe());
    }
}
