//! Memory and disk tier workers

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::dispatcher::TierWorker;
use super::task::{Task, Tier, TierOutcome};
use crate::cache::{CacheKey, CacheMetrics, DiskTier, MemoryTier};
use crate::decode::{decode_blocking, DecodeInput, Decoder, Resource};
use crate::request::SourceType;

/// Insert a freshly decoded resource. A quarantine overflow is a process-wide
/// alert already raised by the memory tier; the load itself still succeeds.
pub(crate) fn cache_in_memory(memory: &MemoryTier, key: &CacheKey, resource: Arc<dyn Resource>) {
    match memory.put(key.clone(), resource) {
        Ok(true) => {}
        Ok(false) => debug!(key = %key.short(), "Served without memory caching"),
        Err(e) => warn!(key = %key.short(), error = %e, "Memory tier over capacity"),
    }
}

/// Memory lookups
pub struct MemoryWorker {
    memory: Arc<MemoryTier>,
    metrics: Arc<CacheMetrics>,
}

impl MemoryWorker {
    pub fn new(memory: Arc<MemoryTier>, metrics: Arc<CacheMetrics>) -> Self {
        Self { memory, metrics }
    }
}

#[async_trait]
impl TierWorker for MemoryWorker {
    fn tier(&self) -> Tier {
        Tier::Memory
    }

    async fn execute(&self, mut task: Task) -> Option<Task> {
        task.start();
        match self.memory.get(&task.key) {
            Some(resource) => {
                self.metrics.record_memory_hit();
                debug!(key = %task.key.short(), task = task.id, "Memory hit");
                task.apply(TierOutcome::Hit(resource));
            }
            None => {
                self.metrics.record_memory_miss();
                task.apply(TierOutcome::Miss);
            }
        }
        Some(task)
    }
}

/// Disk lookups and local file sources
pub struct DiskWorker {
    disk: Arc<DiskTier>,
    memory: Arc<MemoryTier>,
    decoder: Arc<dyn Decoder>,
    metrics: Arc<CacheMetrics>,
}

impl DiskWorker {
    pub fn new(
        disk: Arc<DiskTier>,
        memory: Arc<MemoryTier>,
        decoder: Arc<dyn Decoder>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            disk,
            memory,
            decoder,
            metrics,
        }
    }

    async fn load_local(&self, task: &Task) -> TierOutcome {
        let path = PathBuf::from(&task.request.resource_id);
        if !path.is_file() {
            debug!(path = %path.display(), "Local source missing");
            return TierOutcome::Miss;
        }
        let decoded = decode_blocking(
            self.decoder.clone(),
            DecodeInput::File(path),
            task.request.params.clone(),
        )
        .await;
        match decoded {
            Ok(resource) => {
                cache_in_memory(&self.memory, &task.key, resource.clone());
                TierOutcome::Hit(resource)
            }
            Err(e) => TierOutcome::Failed(Arc::new(e)),
        }
    }

    async fn load_cached(&self, task: &Task) -> TierOutcome {
        let Some(path) = self.disk.read(&task.key) else {
            self.metrics.record_disk_miss();
            return TierOutcome::Miss;
        };

        let decoded = decode_blocking(
            self.decoder.clone(),
            DecodeInput::File(path),
            task.request.params.clone(),
        )
        .await;
        match decoded {
            Ok(resource) => {
                self.metrics.record_disk_hit();
                debug!(key = %task.key.short(), task = task.id, "Disk hit");
                cache_in_memory(&self.memory, &task.key, resource.clone());
                TierOutcome::Hit(resource)
            }
            Err(e) => {
                // unreadable entry: drop it and let the network refill it
                warn!(key = %task.key.short(), error = %e, "Corrupt disk entry, removing");
                if let Err(e) = self.disk.remove(&task.key) {
                    warn!(key = %task.key.short(), error = %e, "Failed to remove corrupt entry");
                }
                self.metrics.record_disk_miss();
                TierOutcome::Miss
            }
        }
    }
}

#[async_trait]
impl TierWorker for DiskWorker {
    fn tier(&self) -> Tier {
        Tier::Disk
    }

    async fn execute(&self, mut task: Task) -> Option<Task> {
        task.start();
        let outcome = match task.request.params.source {
            SourceType::LocalFile => self.load_local(&task).await,
            SourceType::Http => self.load_cached(&task).await,
        };
        if task.is_canceled() && !matches!(outcome, TierOutcome::Hit(_)) {
            task.apply(TierOutcome::Canceled);
        } else {
            task.apply(outcome);
        }
        Some(task)
    }
}
