//! Loader - the caller-facing engine
//!
//! Owns the three tiers and their dispatchers. A load enters at the memory
//! dispatcher; the routing loop moves it down the tiers and delivers the
//! terminal outcome exactly once.
//!
//! # Example
//!
//! ```no_run
//! use tierfetch::{LoadOutcome, LoadParams, Loader, LoaderConfig};
//!
//! # async fn demo() -> tierfetch::Result<()> {
//! let loader = Loader::new(LoaderConfig::new("/var/cache/tierfetch"))?;
//! let handle = loader.load("https://img.example.com/a.png", LoadParams::new())?;
//! if let LoadOutcome::Succeed(resource) = handle.wait().await {
//!     println!("{} bytes from {}", resource.resource().byte_size(), resource.tier());
//!     resource.mark_unused();
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod handle;

pub use config::{LoaderConfig, DEFAULT_URL_LENGTH_LIMIT};
pub use handle::{LoadHandle, LoadOutcome, ResourceHandle};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{
    CacheKey, CacheMetrics, CapacityAlert, DiskConfig, DiskHealth, DiskStats, DiskTier,
    HistoryRing, MemoryConfig, MemoryStats, MemoryTier, MetricsSnapshot,
};
use crate::decode::{Decoder, PassthroughDecoder};
use crate::engine::{
    DiskWorker, Dispatcher, MemoryWorker, Router, Task, TaskState, Tier,
};
use crate::error::{Error, Result};
use crate::network::{
    GroupRegistry, MultiConnectionDownloader, NetworkTier, ReqwestTransport, SpeedRecorder,
    Transport,
};
use crate::request::{LoadParams, LoadRequest};

/// Tiered resource loader
pub struct Loader {
    config: LoaderConfig,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    history: Arc<HistoryRing>,
    metrics: Arc<CacheMetrics>,
    router: Router,
    runtime: Handle,
    shutdown: CancellationToken,
    next_task_id: AtomicU64,
}

impl Loader {
    /// Loader over HTTP with the passthrough decoder
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::with_transport(
            config,
            Arc::new(ReqwestTransport::new()),
            Arc::new(PassthroughDecoder),
        )
    }

    /// Loader with an explicit transport and decoder
    ///
    /// Must be called inside a tokio runtime; the runtime handle is captured
    /// so later calls may come from any thread.
    pub fn with_transport(
        config: LoaderConfig,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("loader must be created inside a tokio runtime".into()))?;
        let shutdown = CancellationToken::new();

        let memory = Arc::new(MemoryTier::with_config(MemoryConfig {
            budget: config.memory_budget,
            quarantine_budget: config.quarantine_budget,
        }));
        let disk = DiskTier::open(
            DiskConfig {
                root: config.disk_path.clone(),
                budget: config.disk_budget,
            },
            DiskHealth::new(config.disk_recovery_interval()),
        )?;
        let history = Arc::new(HistoryRing::new(config.history_capacity));
        let metrics = Arc::new(CacheMetrics::new());
        let (router, routed) = Router::new();

        let memory_dispatcher = Dispatcher::new(
            Arc::new(MemoryWorker::new(memory.clone(), metrics.clone())),
            config.memory_concurrency,
            router.clone(),
            runtime.clone(),
        );
        let disk_dispatcher = Dispatcher::new(
            Arc::new(DiskWorker::new(
                disk.clone(),
                memory.clone(),
                decoder.clone(),
                metrics.clone(),
            )),
            config.disk_concurrency,
            router.clone(),
            runtime.clone(),
        );
        let network = NetworkTier::new(
            MultiConnectionDownloader::new(
                transport,
                Arc::new(SpeedRecorder::new(config.default_connection_speed)),
                config.downloader(),
            ),
            GroupRegistry::new(shutdown.clone()),
            disk.clone(),
            memory.clone(),
            history.clone(),
            decoder,
            metrics.clone(),
            router.clone(),
            config.network(),
        );
        let network_dispatcher = Dispatcher::new(
            Arc::new(network),
            config.network_concurrency,
            router.clone(),
            runtime.clone(),
        );

        runtime.spawn(run_router(
            routed,
            Dispatchers {
                memory: memory_dispatcher,
                disk: disk_dispatcher,
                network: network_dispatcher,
            },
            shutdown.clone(),
            Arc::downgrade(&memory),
            metrics.clone(),
        ));

        info!(
            disk_path = %config.disk_path.display(),
            memory_budget = config.memory_budget,
            disk_budget = config.disk_budget,
            network_class = %config.network_class,
            "Loader started"
        );

        Ok(Self {
            config,
            memory,
            disk,
            history,
            metrics,
            router,
            runtime,
            shutdown,
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Cache key for a request, validating the identifier
    pub fn key_for(&self, resource_id: &str, params: &LoadParams) -> Result<CacheKey> {
        if resource_id.len() > self.config.url_length_limit {
            return Err(Error::InvalidRequest(format!(
                "resource id is {} bytes, limit is {}",
                resource_id.len(),
                self.config.url_length_limit
            )));
        }
        CacheKey::derive(resource_id, params)
    }

    /// Start a load. The outcome arrives through the returned handle.
    pub fn load(&self, resource_id: impl Into<String>, params: LoadParams) -> Result<LoadHandle> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Internal("loader is shut down".into()));
        }
        let resource_id = resource_id.into();
        let key = self.key_for(&resource_id, &params)?;
        let timeout = self.config.caller_timeout(params.indispensable);

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (tx, rx) = oneshot::channel();
        let task = Task::new(
            id,
            key.clone(),
            LoadRequest::new(resource_id, params),
            tx,
            cancel.clone(),
        );
        debug!(task = id, key = %key.short(), "Load queued");
        self.router.route(task);

        Ok(LoadHandle::new(key, rx, cancel, self.shutdown.clone(), timeout))
    }

    /// Start a load and invoke `callback` exactly once with its outcome.
    /// Returns the token that cancels the load.
    pub fn load_with<F>(
        &self,
        resource_id: impl Into<String>,
        params: LoadParams,
        callback: F,
    ) -> Result<CancellationToken>
    where
        F: FnOnce(LoadOutcome) + Send + 'static,
    {
        let handle = self.load(resource_id, params)?;
        let cancel = handle.cancel_token();
        self.runtime.spawn(async move {
            callback(handle.wait().await);
        });
        Ok(cancel)
    }

    /// Memory-only lookup; marks the entry in use
    pub fn get(&self, resource_id: &str, params: &LoadParams) -> Result<Option<ResourceHandle>> {
        let key = self.key_for(resource_id, params)?;
        Ok(self.memory.get(&key).map(|resource| {
            ResourceHandle::new(key, resource, Tier::Memory, Arc::downgrade(&self.memory))
        }))
    }

    /// The caller no longer displays this resource
    pub fn mark_unused(&self, resource_id: &str, params: &LoadParams) -> Result<bool> {
        let key = self.key_for(resource_id, params)?;
        Ok(self.memory.mark_unused(&key))
    }

    /// Delete every disk record and forget recent fetches
    ///
    /// Must not be called while loads are in flight.
    pub fn wipe_disk_cache(&self) -> Result<()> {
        self.disk.wipe()?;
        self.history.clear();
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    pub fn disk_stats(&self) -> DiskStats {
        self.disk.stats()
    }

    /// One-line memory tier summary
    pub fn memory_report(&self) -> String {
        self.memory.report()
    }

    /// Quarantine overflow alerts
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<CapacityAlert> {
        self.memory.subscribe()
    }

    pub fn is_disk_healthy(&self) -> bool {
        self.disk.is_healthy()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Stop routing. Pending loads resolve to `Canceled`.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Loader shutting down");
            self.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("disk_path", &self.config.disk_path)
            .field("disk_healthy", &self.disk.is_healthy())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Dispatchers {
    memory: Dispatcher,
    disk: Dispatcher,
    network: Dispatcher,
}

impl Dispatchers {
    fn for_tier(&self, tier: Tier) -> &Dispatcher {
        match tier {
            Tier::Memory => &self.memory,
            Tier::Disk => &self.disk,
            Tier::Network => &self.network,
        }
    }
}

async fn run_router(
    mut routed: mpsc::UnboundedReceiver<Task>,
    dispatchers: Dispatchers,
    shutdown: CancellationToken,
    memory: Weak<MemoryTier>,
    metrics: Arc<CacheMetrics>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = routed.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if task.state().is_terminal() {
            deliver(task, &memory, &metrics);
        } else {
            dispatchers.for_tier(task.tier()).submit(task);
        }
    }
    debug!("Router stopped");
}

/// Send the terminal outcome to the caller
fn deliver(mut task: Task, memory: &Weak<MemoryTier>, metrics: &CacheMetrics) {
    let outcome = match task.state() {
        TaskState::Succeed => match (task.resource.take(), task.served_by) {
            (Some(resource), Some(tier)) => {
                metrics.record_succeeded();
                LoadOutcome::Succeed(ResourceHandle::new(
                    task.key.clone(),
                    resource,
                    tier,
                    memory.clone(),
                ))
            }
            _ => {
                metrics.record_failed();
                LoadOutcome::Failed(Arc::new(Error::Internal(
                    "succeeded without a resource".into(),
                )))
            }
        },
        TaskState::Failed => {
            metrics.record_failed();
            LoadOutcome::Failed(task.error.take().unwrap_or_else(|| {
                Arc::new(Error::Internal("failed without an error".into()))
            }))
        }
        _ => {
            metrics.record_canceled();
            LoadOutcome::Canceled
        }
    };
    debug!(
        task = task.id(),
        key = %task.key().short(),
        state = ?task.state(),
        elapsed = ?task.created.elapsed(),
        "Load finished"
    );

    let Some(responder) = task.responder.take() else {
        return;
    };
    if let Err(LoadOutcome::Succeed(handle)) = responder.send(outcome) {
        // caller stopped waiting
        handle.mark_unused();
    }
}
