//! Network Tier Worker
//!
//! ```text
//!   task ──► history hit? ──yes──► Redirect (back to disk, bounded per task)
//!              │ no
//!              ▼
//!         GroupRegistry::join ──Member──► parked until the leader finishes
//!              │ Leader
//!              ▼
//!         disk healthy? ──yes──► download into DiskWriter ──commit──┐
//!              │ no                  │ disk error                  │
//!              ▼                     ▼                             │
//!         download into memory ◄─────┘                             │
//!              │ recovery write (rate-limited)                     │
//!              ▼                                                   ▼
//!           decode once ──► memory tier ──► same outcome to every member
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::downloader::{DownloadJob, Escalation, MultiConnectionDownloader};
use super::group::{FetchTicket, GroupRegistry, Join};
use super::strategy::{LowSpeedStrategy, NetworkClass};
use super::transport::Timeouts;
use crate::cache::{CacheKey, CacheMetrics, DiskTier, HistoryRing, MemoryTier};
use crate::decode::{decode_blocking, DecodeInput, Decoder, Resource};
use crate::engine::{cache_in_memory, Router, Task, TaskState, Tier, TierOutcome, TierWorker};
use crate::error::{Error, Result};
use crate::request::LoadRequest;
use crate::sink::{ByteSink, MemorySink, DEFAULT_MEMORY_SINK_LIMIT};

/// How often a history hit may send a task back to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryRedirect {
    /// Always go to the network
    Never,
    /// First network visit only
    #[default]
    OncePerTask,
    /// Up to `n` bounces per task
    UpTo(u32),
}

impl HistoryRedirect {
    /// Whether a task already bounced `bounces` times may bounce again
    pub fn allows(self, bounces: u32) -> bool {
        match self {
            HistoryRedirect::Never => false,
            HistoryRedirect::OncePerTask => bounces == 0,
            HistoryRedirect::UpTo(limit) => bounces < limit,
        }
    }
}

/// Network tier tuning
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub timeouts: Timeouts,
    pub network_class: NetworkClass,
    pub low_speed: LowSpeedStrategy,
    pub history_redirect: HistoryRedirect,
    /// Reject resources larger than this
    pub data_length_limit: Option<u64>,
    /// Cap on a body buffered in memory
    pub memory_buffer_limit: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            network_class: NetworkClass::Wifi,
            low_speed: LowSpeedStrategy::default(),
            history_redirect: HistoryRedirect::default(),
            data_length_limit: None,
            memory_buffer_limit: DEFAULT_MEMORY_SINK_LIMIT,
        }
    }
}

/// Network tier worker: dedup, fetch, decode, fan-out
pub struct NetworkTier {
    downloader: MultiConnectionDownloader,
    groups: GroupRegistry,
    disk: Arc<DiskTier>,
    memory: Arc<MemoryTier>,
    history: Arc<HistoryRing>,
    decoder: Arc<dyn Decoder>,
    metrics: Arc<CacheMetrics>,
    router: Router,
    settings: NetworkSettings,
}

impl NetworkTier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        downloader: MultiConnectionDownloader,
        groups: GroupRegistry,
        disk: Arc<DiskTier>,
        memory: Arc<MemoryTier>,
        history: Arc<HistoryRing>,
        decoder: Arc<dyn Decoder>,
        metrics: Arc<CacheMetrics>,
        router: Router,
        settings: NetworkSettings,
    ) -> Self {
        Self {
            downloader,
            groups,
            disk,
            memory,
            history,
            decoder,
            metrics,
            router,
            settings,
        }
    }

    /// Fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.groups.in_flight()
    }

    fn should_redirect(&self, task: &Task) -> bool {
        self.disk.is_healthy()
            && self.settings.history_redirect.allows(task.network_bounces)
            && self.history.contains(&task.key)
    }

    fn job(&self, request: &LoadRequest, ticket: &FetchTicket) -> DownloadJob {
        let indispensable = ticket.is_indispensable();
        let class = self.settings.network_class;
        let timeouts = if indispensable {
            self.settings.timeouts.relaxed()
        } else {
            self.settings.timeouts
        };
        DownloadJob {
            url: request.resource_id.clone(),
            timeouts,
            low_speed: self.settings.low_speed.select(class, indispensable),
            length_limit: self.settings.data_length_limit,
            cancel: ticket.cancel.clone(),
            escalation: (!indispensable).then(|| Escalation {
                flag: ticket.indispensable.clone(),
                low_speed: self.settings.low_speed.select(class, true),
            }),
        }
    }

    #[instrument(skip_all, fields(key = %key.short(), url = %request.resource_id))]
    async fn fetch(&self, key: &CacheKey, request: &LoadRequest, ticket: &FetchTicket) -> TierOutcome {
        let job = self.job(request, ticket);

        let result = if self.disk.is_healthy() {
            match self.fetch_to_disk(key, request, &job).await {
                Err(e) if e.is_disk() => {
                    warn!(error = %e, "Disk write failed, fetching into memory");
                    self.metrics.record_disk_fallback();
                    self.fetch_to_memory(key, request, &job).await
                }
                other => other,
            }
        } else {
            debug!("Disk unhealthy, fetching into memory");
            self.metrics.record_disk_fallback();
            self.fetch_to_memory(key, request, &job).await
        };

        match result {
            Ok(resource) => {
                cache_in_memory(&self.memory, key, resource.clone());
                TierOutcome::Hit(resource)
            }
            Err(Error::Canceled) => {
                debug!("Fetch canceled");
                TierOutcome::Canceled
            }
            Err(e) => {
                if e.is_low_speed() {
                    self.metrics.record_low_speed_abort();
                } else {
                    self.metrics.record_network_failure();
                }
                warn!(error = %e, "Fetch failed");
                TierOutcome::Failed(Arc::new(e))
            }
        }
    }

    async fn fetch_to_disk(
        &self,
        key: &CacheKey,
        request: &LoadRequest,
        job: &DownloadJob,
    ) -> Result<Arc<dyn Resource>> {
        let writer = self.disk.begin_write(key, None)?;
        let sink: Arc<dyn ByteSink> = Arc::new(writer.sink()?);

        let report = match self.downloader.download(job, sink).await {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, Error::DiskIo { .. }) {
                    self.disk.health().mark_unhealthy("download write failed");
                }
                writer.abort();
                return Err(e);
            }
        };
        self.metrics.record_bytes_downloaded(report.bytes);

        let committed = writer.commit()?;
        if !committed.is_transient() {
            self.history.put(key.clone());
        }
        info!(bytes = report.bytes, connections = report.connections, "Fetched to disk");

        let decoded = decode_blocking(
            self.decoder.clone(),
            DecodeInput::File(committed.path().to_path_buf()),
            request.params.clone(),
        )
        .await;
        if decoded.is_err() && !committed.is_transient() {
            // never leave undecodable bytes behind for the disk tier
            if let Err(e) = self.disk.remove(key) {
                warn!(error = %e, "Failed to drop undecodable disk entry");
            }
        }
        decoded
    }

    async fn fetch_to_memory(
        &self,
        key: &CacheKey,
        request: &LoadRequest,
        job: &DownloadJob,
    ) -> Result<Arc<dyn Resource>> {
        let sink = Arc::new(MemorySink::with_limit(self.settings.memory_buffer_limit));
        let report = self.downloader.download(job, sink.clone()).await?;
        self.metrics.record_bytes_downloaded(report.bytes);
        let bytes = sink.take();
        info!(bytes = report.bytes, connections = report.connections, "Fetched to memory");

        if self.try_recovery_write(key, &bytes) {
            self.history.put(key.clone());
        }
        decode_blocking(self.decoder.clone(), DecodeInput::Bytes(bytes), request.params.clone())
            .await
    }

    /// Write a memory-buffered body to disk if a probe is due. Returns true
    /// when the body is now indexed on disk.
    fn try_recovery_write(&self, key: &CacheKey, bytes: &Bytes) -> bool {
        let health = self.disk.health();
        if !health.should_probe() {
            return false;
        }
        let was_unhealthy = !health.is_healthy();

        let written = self
            .disk
            .begin_write(key, Some(bytes.len() as u64))
            .and_then(|mut writer| {
                writer.write(bytes)?;
                writer.commit()
            });
        match written {
            Ok(committed) => {
                if was_unhealthy {
                    self.metrics.record_disk_recovery();
                }
                !committed.is_transient()
            }
            Err(e) => {
                debug!(key = %key.short(), error = %e, "Recovery write failed");
                false
            }
        }
    }

    /// Hand the outcome to every group member
    fn fan_out(&self, key: &CacheKey, outcome: TierOutcome) {
        let members = self.groups.complete(key);
        let count = members.len();
        let mut delivered = false;

        for mut member in members {
            if member.is_canceled() {
                member.apply(TierOutcome::Canceled);
            } else if matches!(outcome, TierOutcome::Canceled) && !self.groups.is_shut_down() {
                // joined after every earlier member withdrew; fetch again
                debug!(key = %key.short(), task = member.id(), "Fetch canceled under a live member, requeueing");
                member.state = TaskState::StandBy;
            } else {
                delivered |= matches!(outcome, TierOutcome::Hit(_));
                member.apply(outcome.clone());
            }
            self.router.route(member);
        }

        if matches!(outcome, TierOutcome::Hit(_)) && !delivered {
            // cached on behalf of callers that all withdrew
            self.memory.mark_unused(key);
        }
        debug!(key = %key.short(), members = count, ?outcome, "Fetch group completed");
    }
}

/// Releases the group if the leader's fetch never finishes, e.g. on a panic
/// or when the future is dropped
struct LeaderGuard<'a> {
    tier: &'a NetworkTier,
    key: &'a CacheKey,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!(key = %self.key.short(), "Fetch aborted before completing");
            let error = Error::Internal("network fetch aborted".into());
            self.tier.fan_out(self.key, TierOutcome::Failed(Arc::new(error)));
        }
    }
}

#[async_trait]
impl TierWorker for NetworkTier {
    fn tier(&self) -> Tier {
        Tier::Network
    }

    async fn execute(&self, mut task: Task) -> Option<Task> {
        task.start();

        if self.should_redirect(&task) {
            self.metrics.record_history_redirect();
            debug!(key = %task.key.short(), task = task.id, "Recently fetched, retrying disk");
            task.apply(TierOutcome::Redirect);
            return Some(task);
        }

        let key = task.key.clone();
        let request = task.request.clone();
        match self.groups.join(task) {
            Join::Member => {
                self.metrics.record_coalesced();
                debug!(key = %key.short(), "Joined in-flight fetch");
            }
            Join::Leader(ticket) => {
                self.metrics.record_network_fetch();
                let mut guard = LeaderGuard {
                    tier: self,
                    key: &key,
                    armed: true,
                };
                let outcome = self.fetch(&key, &request, &ticket).await;
                guard.armed = false;
                self.fan_out(&key, outcome);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DiskConfig, DiskHealth};
    use crate::decode::{Blob, PassthroughDecoder};
    use crate::network::downloader::DownloaderConfig;
    use crate::network::range::ByteRange;
    use crate::network::speed::SpeedRecorder;
    use crate::network::transport::{FetchResponse, InMemoryTransport, ServedResource, Transport};
    use crate::request::LoadParams;
    use assert_matches::assert_matches;
    use futures::{FutureExt, StreamExt};
    use std::panic::AssertUnwindSafe;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    const URL: &str = "http://cdn.example/a.png";

    struct Fixture {
        tier: NetworkTier,
        routed: mpsc::UnboundedReceiver<Task>,
        transport: Arc<InMemoryTransport>,
        disk: Arc<DiskTier>,
        memory: Arc<MemoryTier>,
        history: Arc<HistoryRing>,
        metrics: Arc<CacheMetrics>,
        _dir: tempfile::TempDir,
    }

    fn fixture(health: DiskHealth) -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        Fixture {
            transport: transport.clone(),
            ..fixture_over(health, transport)
        }
    }

    fn fixture_over(health: DiskHealth, wire: Arc<dyn Transport>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(DiskConfig::new(dir.path()), health).unwrap();
        let memory = Arc::new(MemoryTier::new());
        let history = Arc::new(HistoryRing::default());
        let metrics = Arc::new(CacheMetrics::new());
        let (router, routed) = Router::new();
        let tier = NetworkTier::new(
            MultiConnectionDownloader::new(
                wire,
                Arc::new(SpeedRecorder::default()),
                DownloaderConfig::default(),
            ),
            GroupRegistry::new(CancellationToken::new()),
            disk.clone(),
            memory.clone(),
            history.clone(),
            Arc::new(PassthroughDecoder),
            metrics.clone(),
            router,
            NetworkSettings::default(),
        );
        Fixture {
            tier,
            routed,
            transport: Arc::new(InMemoryTransport::new()),
            disk,
            memory,
            history,
            metrics,
            _dir: dir,
        }
    }

    fn task(id: u64) -> Task {
        let params = LoadParams::default();
        let (tx, _rx) = oneshot::channel();
        let mut task = Task::new(
            id,
            CacheKey::derive(URL, &params).unwrap(),
            LoadRequest::new(URL, params),
            tx,
            CancellationToken::new(),
        );
        task.tier = Tier::Network;
        task
    }

    #[test]
    fn test_history_redirect_policy() {
        assert!(!HistoryRedirect::Never.allows(0));
        assert!(HistoryRedirect::OncePerTask.allows(0));
        assert!(!HistoryRedirect::OncePerTask.allows(1));
        assert!(HistoryRedirect::UpTo(2).allows(1));
        assert!(!HistoryRedirect::UpTo(2).allows(2));
    }

    #[tokio::test]
    async fn test_fetch_stores_on_disk_and_memory() {
        let mut f = fixture(DiskHealth::default());
        f.transport.serve(URL, ServedResource::new(&b"image bytes"[..]));

        assert!(f.tier.execute(task(1)).await.is_none());
        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Succeed);
        assert_eq!(done.served_by, Some(Tier::Network));

        let key = done.key().clone();
        assert!(f.disk.contains(&key));
        assert!(f.memory.contains(&key));
        assert!(f.history.contains(&key));
        assert_eq!(f.tier.in_flight(), 0);

        let blob = done.resource.as_ref().unwrap();
        let blob = blob.as_any().downcast_ref::<Blob>().unwrap();
        assert_eq!(blob.bytes().unwrap(), Bytes::from_static(b"image bytes"));
    }

    #[tokio::test]
    async fn test_history_hit_redirects_once() {
        let mut f = fixture(DiskHealth::default());
        let first = task(1);
        f.history.put(first.key().clone());

        let redirected = f.tier.execute(first).await.unwrap();
        assert_eq!(redirected.tier(), Tier::Disk);
        assert_eq!(redirected.network_bounces, 1);

        // second network visit fetches
        f.transport.serve(URL, ServedResource::new(&b"x"[..]));
        let mut again = redirected;
        again.tier = Tier::Network;
        assert!(f.tier.execute(again).await.is_none());
        assert_eq!(f.routed.recv().await.unwrap().state(), TaskState::Succeed);
        assert_eq!(f.metrics.snapshot().history_redirects, 1);
        assert_eq!(f.transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_disk_buffers_in_memory() {
        let health = DiskHealth::new(Duration::from_secs(3600));
        let mut f = fixture(health.clone());
        health.mark_unhealthy("test");
        f.transport.serve(URL, ServedResource::new(&b"payload"[..]));

        f.tier.execute(task(1)).await;
        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Succeed);
        // probe not due yet: nothing written
        assert!(!f.disk.contains(done.key()));
        assert_eq!(f.metrics.snapshot().disk_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_recovery_write_restores_health() {
        let health = DiskHealth::new(Duration::ZERO);
        let mut f = fixture(health.clone());
        health.mark_unhealthy("test");
        f.transport.serve(URL, ServedResource::new(&b"payload"[..]));

        f.tier.execute(task(1)).await;
        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Succeed);
        assert!(f.disk.is_healthy());
        assert!(f.disk.contains(done.key()));
        assert_eq!(f.metrics.snapshot().disk_recoveries, 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_member() {
        let mut f = fixture(DiskHealth::default());
        f.transport.serve(
            URL,
            ServedResource::new(&b"x"[..])
                .with_status(503)
                .with_latency(Duration::from_millis(50)),
        );

        let tier = Arc::new(f.tier);
        let leader = tokio::spawn({
            let tier = tier.clone();
            async move { tier.execute(task(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tier.execute(task(2)).await.is_none());
        assert!(leader.await.unwrap().is_none());

        for _ in 0..2 {
            let member = f.routed.recv().await.unwrap();
            assert_eq!(member.state(), TaskState::Failed);
            assert!(member.error.as_ref().unwrap().is_network());
        }
        assert_eq!(f.transport.total_requests(), 1);
        assert_eq!(f.metrics.snapshot().coalesced_joins, 1);
    }

    /// Advertises a resource of almost `u64::MAX` bytes
    struct HugeTotal;

    #[async_trait]
    impl Transport for HugeTotal {
        async fn fetch(
            &self,
            _url: &str,
            _range: Option<ByteRange>,
            _timeouts: Timeouts,
        ) -> Result<FetchResponse> {
            Ok(FetchResponse {
                status: 206,
                content_range: Some("bytes 0-0/18446744073709551000".into()),
                content_length: Some(1),
                body: futures::stream::iter([Ok(Bytes::from_static(b"x"))]).boxed(),
            })
        }
    }

    struct Exploding;

    #[async_trait]
    impl Transport for Exploding {
        async fn fetch(
            &self,
            _url: &str,
            _range: Option<ByteRange>,
            _timeouts: Timeouts,
        ) -> Result<FetchResponse> {
            panic!("transport exploded");
        }
    }

    #[tokio::test]
    async fn test_oversized_total_fails_memory_fetch() {
        let health = DiskHealth::new(Duration::from_secs(3600));
        let mut f = fixture_over(health.clone(), Arc::new(HugeTotal));
        health.mark_unhealthy("test");

        assert!(f.tier.execute(task(1)).await.is_none());
        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Failed);
        assert_matches!(
            done.error.as_deref(),
            Some(Error::DataLengthExceeded {
                limit: DEFAULT_MEMORY_SINK_LIMIT,
                ..
            })
        );
        assert_eq!(f.tier.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_group() {
        let mut f = fixture_over(DiskHealth::default(), Arc::new(Exploding));

        let result = AssertUnwindSafe(f.tier.execute(task(1))).catch_unwind().await;
        assert!(result.is_err());

        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Failed);
        assert_matches!(done.error.as_deref(), Some(Error::Internal(_)));
        assert_eq!(f.tier.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_live_member_refetches_after_withdrawn_fetch() {
        let mut f = fixture(DiskHealth::default());
        let leader = task(1);
        let leader_cancel = leader.cancel.clone();
        let key = leader.key().clone();
        let ticket = match f.tier.groups.join(leader) {
            Join::Leader(ticket) => ticket,
            Join::Member => panic!("expected a fresh group"),
        };

        // every caller so far withdrew and the fetch was stopped
        leader_cancel.cancel();
        ticket.cancel.cancel();

        // a new caller arrives before the stopped fetch hands back
        assert!(f.tier.execute(task(2)).await.is_none());
        f.tier.fan_out(&key, TierOutcome::Canceled);

        let withdrawn = f.routed.recv().await.unwrap();
        assert_eq!(withdrawn.id(), 1);
        assert_eq!(withdrawn.state(), TaskState::Canceled);
        let live = f.routed.recv().await.unwrap();
        assert_eq!(live.id(), 2);
        assert_eq!(live.state(), TaskState::StandBy);
        assert_eq!(live.tier(), Tier::Network);

        f.transport.serve(URL, ServedResource::new(&b"fresh"[..]));
        assert!(f.tier.execute(live).await.is_none());
        let done = f.routed.recv().await.unwrap();
        assert_eq!(done.state(), TaskState::Succeed);
        assert_eq!(f.transport.total_requests(), 1);
    }
}
