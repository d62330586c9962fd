//! Multi-Connection Downloader
//!
//! Fetches one resource over one or more ranged connections, writing every
//! block at its absolute offset in a [`ByteSink`].
//!
//! # Flow
//!
//! ```text
//!  probe GET Range: 0..probe_size-1
//!     │
//!     ├─ 200, no Content-Range ──────────► single connection (probe body)
//!     ├─ unusable Content-Range ─────────► restart: one full GET
//!     └─ 206 bytes 0-e/total
//!           │  n = argmin  L·n + S/(V·n)   over [min, max]
//!           ▼
//!        [probe block 0..=e][ block 2 ][ block 3 ] ... (n-1 even blocks)
//!           │ any sub-reply with the wrong range ─► restart: one full GET
//!           ▼
//!        one task per block ──► sink.write_at(offset)
//!        watcher every 500ms ─► SpeedWatch / hard stop at 2 × deadline
//! ```
//!
//! L is the probe's time to headers and V the host's recorded per-connection
//! speed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::range::{parse_content_range, partition, ByteRange, RangeReply};
use super::speed::SpeedRecorder;
use super::strategy::{LowSpeedConfigure, LowSpeedReason, SpeedVerdict, SpeedWatch};
use super::transport::{BodyStream, FetchResponse, Timeouts, Transport};
use crate::error::{Error, Result};
use crate::sink::ByteSink;

/// Default probe range (32KB)
pub const DEFAULT_PROBE_SIZE: u64 = 32 * 1024;

/// Default size below which one extra connection is used (128KB)
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 128 * 1024;

/// Default maximum connections per download
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Default watcher sampling interval
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Downloader configuration
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub max_connections: usize,
    pub min_connections: usize,
    /// Bytes requested by the probe connection
    pub probe_size: u64,
    /// Resources smaller than this use a single extra connection
    pub split_threshold: u64,
    pub watch_interval: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            probe_size: DEFAULT_PROBE_SIZE,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }
}

/// One download request
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub timeouts: Timeouts,
    pub low_speed: LowSpeedConfigure,
    /// Abort when the resource is larger than this
    pub length_limit: Option<u64>,
    /// Tears down every connection when cancelled
    pub cancel: CancellationToken,
    /// Relaxed low-speed rule adopted mid-flight
    pub escalation: Option<Escalation>,
}

impl DownloadJob {
    /// Low-speed rule currently in force
    pub fn active_low_speed(&self) -> LowSpeedConfigure {
        match &self.escalation {
            Some(escalation) if escalation.flag.load(Ordering::Acquire) => escalation.low_speed,
            _ => self.low_speed,
        }
    }
}

/// Swap to `low_speed` once `flag` is raised, e.g. when an indispensable
/// caller joins a fetch that started without one
#[derive(Debug, Clone)]
pub struct Escalation {
    pub flag: Arc<AtomicBool>,
    pub low_speed: LowSpeedConfigure,
}

/// Outcome of a successful download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    /// Size announced by the server
    pub total: Option<u64>,
    pub connections: usize,
    pub elapsed: Duration,
    /// Ranged plan abandoned for one full-body connection
    pub restarted: bool,
}

struct Block {
    offset: u64,
    /// Bytes this connection must deliver, when known
    expected: Option<u64>,
    body: BodyStream,
}

struct Plan {
    blocks: Vec<Block>,
    total: Option<u64>,
    restarted: bool,
}

/// Estimated seconds to fetch `total` bytes over `connections` connections
pub fn estimated_time(total: u64, latency: Duration, speed: u64, connections: usize) -> f64 {
    let n = connections.max(1) as f64;
    latency.as_secs_f64() * n + total as f64 / (speed.max(1) as f64 * n)
}

/// Connection count in `[min, max]` minimizing [`estimated_time`]; ties go
/// to fewer connections
pub fn optimal_connections(
    total: u64,
    latency: Duration,
    speed: u64,
    min: usize,
    max: usize,
) -> usize {
    let min = min.max(1);
    let max = max.max(min);
    (min..=max)
        .min_by(|&a, &b| {
            estimated_time(total, latency, speed, a)
                .partial_cmp(&estimated_time(total, latency, speed, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(min)
}

/// Multi-connection downloader
pub struct MultiConnectionDownloader {
    transport: Arc<dyn Transport>,
    speeds: Arc<SpeedRecorder>,
    config: DownloaderConfig,
}

impl MultiConnectionDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        speeds: Arc<SpeedRecorder>,
        config: DownloaderConfig,
    ) -> Self {
        Self {
            transport,
            speeds,
            config,
        }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Download `job.url` into `sink`
    #[instrument(skip(self, job, sink), fields(url = %job.url))]
    pub async fn download(
        &self,
        job: &DownloadJob,
        sink: Arc<dyn ByteSink>,
    ) -> Result<DownloadReport> {
        let started = Instant::now();
        let plan = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return Err(Error::Canceled),
            plan = self.plan(job, sink.as_ref()) => plan?,
        };

        let connections = plan.blocks.len();
        let total = plan.total;
        let restarted = plan.restarted;
        debug!(connections, ?total, restarted, "Download planned");

        let limit = size_limit(job, sink.as_ref());
        let progress = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::new();
        for block in plan.blocks {
            workers.spawn(run_block(
                block,
                sink.clone(),
                progress.clone(),
                job.timeouts.read,
                job.url.clone(),
                limit,
            ));
        }

        let mut ticker = tokio::time::interval(self.config.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = job.cancel.cancelled() => {
                    workers.abort_all();
                    debug!("Download canceled");
                    return Err(Error::Canceled);
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(_))) => {}
                    Some(Ok(Err(e))) => {
                        workers.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        workers.abort_all();
                        return Err(Error::Internal(format!("download worker failed: {}", e)));
                    }
                },
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let loaded = progress.load(Ordering::Relaxed);
                    let watch = SpeedWatch::new(job.active_low_speed());
                    let hard_deadline = watch.configure().deadline() * 2;
                    let verdict = if elapsed >= hard_deadline {
                        SpeedVerdict::Abort {
                            reason: LowSpeedReason::HardDeadline,
                            speed_bps: (loaded as f64 / elapsed.as_secs_f64()) as u64,
                        }
                    } else {
                        watch.observe(elapsed, loaded, total)
                    };
                    if let SpeedVerdict::Abort { reason, speed_bps } = verdict {
                        workers.abort_all();
                        warn!(?elapsed, loaded, ?total, speed_bps, %reason, "Low network speed, aborting");
                        return Err(SpeedWatch::abort_error(elapsed, reason, speed_bps));
                    }
                }
            }
        }

        let bytes = progress.load(Ordering::Relaxed);
        if let Some(total) = total {
            if bytes != total {
                return Err(Error::network(
                    job.url.clone(),
                    format!("received {} of {} bytes", bytes, total),
                ));
            }
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && bytes > 0 {
            self.speeds
                .record(&job.url, (bytes as f64 / secs / connections as f64) as u64);
        }
        info!(bytes, connections, ?elapsed, restarted, "Download complete");

        Ok(DownloadReport {
            bytes,
            total,
            connections,
            elapsed,
            restarted,
        })
    }

    async fn plan(&self, job: &DownloadJob, sink: &dyn ByteSink) -> Result<Plan> {
        let probe_range = ByteRange::new(0, self.config.probe_size.max(1) - 1);
        let probe_started = Instant::now();
        let probe = self
            .transport
            .fetch(&job.url, Some(probe_range), job.timeouts)
            .await?;
        let latency = probe_started.elapsed();

        let (range, total) = match parse_content_range(probe.content_range.as_deref()) {
            RangeReply::Whole => return single(job, sink, probe, false),
            RangeReply::Partial { range, total } if range.start == 0 => (range, total),
            reply => {
                debug!(?reply, "Probe reply unusable, restarting with one connection");
                drop(probe);
                return self.restart(job, sink).await;
            }
        };

        check_limit(size_limit(job, sink), Some(total))?;
        sink.reset(Some(total)).map_err(|e| Error::disk("allocate", e))?;

        let mut blocks = vec![Block {
            offset: 0,
            expected: Some(range.len()),
            body: probe.body,
        }];
        if range.end + 1 < total {
            let extra = if total < self.config.split_threshold {
                1
            } else {
                let speed = self.speeds.speed_of(&job.url);
                let n = optimal_connections(
                    total,
                    latency,
                    speed,
                    self.config.min_connections,
                    self.config.max_connections,
                );
                debug!(?latency, speed, connections = n, "Sized connection pool");
                n.saturating_sub(1).max(1)
            };

            for sub in partition(range.end + 1, total - 1, extra) {
                let response = self.transport.fetch(&job.url, Some(sub), job.timeouts).await?;
                match parse_content_range(response.content_range.as_deref()) {
                    RangeReply::Partial {
                        range: got,
                        total: got_total,
                    } if got == sub && got_total == total => blocks.push(Block {
                        offset: sub.start,
                        expected: Some(sub.len()),
                        body: response.body,
                    }),
                    reply => {
                        warn!(expected = %sub, ?reply, "Range mismatch, restarting with one connection");
                        drop(blocks);
                        drop(response);
                        return self.restart(job, sink).await;
                    }
                }
            }
        }

        Ok(Plan {
            blocks,
            total: Some(total),
            restarted: false,
        })
    }

    async fn restart(&self, job: &DownloadJob, sink: &dyn ByteSink) -> Result<Plan> {
        let response = self.transport.fetch(&job.url, None, job.timeouts).await?;
        single(job, sink, response, true)
    }
}

fn single(
    job: &DownloadJob,
    sink: &dyn ByteSink,
    response: FetchResponse,
    restarted: bool,
) -> Result<Plan> {
    let total = response.content_length;
    check_limit(size_limit(job, sink), total)?;
    sink.reset(total).map_err(|e| Error::disk("allocate", e))?;
    Ok(Plan {
        blocks: vec![Block {
            offset: 0,
            expected: total,
            body: response.body,
        }],
        total,
        restarted,
    })
}

/// Tightest of the job's length limit and what the sink can hold
fn size_limit(job: &DownloadJob, sink: &dyn ByteSink) -> Option<u64> {
    match (job.length_limit, sink.max_len()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn check_limit(limit: Option<u64>, size: Option<u64>) -> Result<()> {
    match (size, limit) {
        (Some(size), Some(limit)) if size > limit => {
            Err(Error::DataLengthExceeded { size, limit })
        }
        _ => Ok(()),
    }
}

/// Stream one block into the sink at its offset
async fn run_block(
    block: Block,
    sink: Arc<dyn ByteSink>,
    progress: Arc<AtomicU64>,
    read_timeout: Duration,
    url: String,
    length_limit: Option<u64>,
) -> Result<u64> {
    let Block {
        offset: start,
        expected,
        mut body,
    } = block;
    let mut written = 0u64;

    loop {
        if expected == Some(written) {
            break;
        }
        let next = tokio::time::timeout(read_timeout, body.next())
            .await
            .map_err(|_| Error::Timeout(read_timeout))?;
        let Some(chunk) = next else {
            break;
        };
        let mut chunk = chunk?;
        if let Some(expected) = expected {
            let remaining = (expected - written) as usize;
            if chunk.len() > remaining {
                chunk.truncate(remaining);
            }
        }
        if chunk.is_empty() {
            continue;
        }

        let len = chunk.len() as u64;
        let loaded = progress.fetch_add(len, Ordering::Relaxed) + len;
        if let Some(limit) = length_limit {
            if loaded > limit {
                return Err(Error::DataLengthExceeded {
                    size: loaded,
                    limit,
                });
            }
        }
        sink.write_at(start + written, &chunk)
            .map_err(|e| Error::disk("write", e))?;
        written += len;
    }

    match expected {
        Some(expected) if written < expected => Err(Error::network(
            url,
            format!(
                "connection closed at offset {} after {} of {} bytes",
                start + written,
                written,
                expected
            ),
        )),
        _ => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::strategy::NetworkClass;
    use crate::network::transport::{InMemoryTransport, ServedResource};
    use crate::sink::MemorySink;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use proptest::prelude::*;

    const URL: &str = "http://cdn.example/pic.jpg";

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>())
    }

    fn job() -> DownloadJob {
        DownloadJob {
            url: URL.to_string(),
            timeouts: Timeouts::new(Duration::from_secs(3), Duration::from_secs(5)),
            low_speed: LowSpeedConfigure::new(
                NetworkClass::Wifi,
                Duration::from_secs(10),
                Duration::from_secs(30),
                1,
            )
            .unwrap(),
            length_limit: None,
            cancel: CancellationToken::new(),
            escalation: None,
        }
    }

    fn downloader(transport: Arc<InMemoryTransport>) -> MultiConnectionDownloader {
        MultiConnectionDownloader::new(
            transport,
            Arc::new(SpeedRecorder::default()),
            DownloaderConfig::default(),
        )
    }

    #[test]
    fn test_optimal_connections_prefers_parallelism_for_large_payloads() {
        // no latency cost: more connections always help
        assert_eq!(optimal_connections(1 << 20, Duration::ZERO, 1024, 1, 4), 4);
        // huge latency: one connection
        assert_eq!(
            optimal_connections(1024, Duration::from_secs(10), 1 << 20, 1, 4),
            1
        );
        // degenerate bounds
        assert_eq!(optimal_connections(1 << 20, Duration::ZERO, 1024, 0, 0), 1);
    }

    #[tokio::test]
    async fn test_multi_connection_matches_single_connection() {
        let data = pattern(300 * 1024 + 17);

        let ranged = Arc::new(InMemoryTransport::new());
        ranged.serve(URL, ServedResource::new(data.clone()));
        let sink = Arc::new(MemorySink::new());
        let report = downloader(ranged.clone())
            .download(&job(), sink.clone())
            .await
            .unwrap();
        assert_eq!(report.connections, 4);
        assert_eq!(report.total, Some(data.len() as u64));
        assert!(!report.restarted);
        assert_eq!(ranged.ranged_requests(URL), 4);
        let multi = sink.take();

        let plain = Arc::new(InMemoryTransport::new());
        plain.serve(URL, ServedResource::new(data.clone()).without_ranges());
        let sink = Arc::new(MemorySink::new());
        let report = downloader(plain.clone())
            .download(&job(), sink.clone())
            .await
            .unwrap();
        assert_eq!(report.connections, 1);
        assert_eq!(plain.requests(URL), 1);
        let single = sink.take();

        assert_eq!(multi, single);
        assert_eq!(multi, data);
    }

    #[tokio::test]
    async fn test_small_resource_fits_in_probe() {
        let data = pattern(1000);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(URL, ServedResource::new(data.clone()));

        let sink = Arc::new(MemorySink::new());
        let report = downloader(transport.clone())
            .download(&job(), sink.clone())
            .await
            .unwrap();
        assert_eq!(report.connections, 1);
        assert_eq!(transport.requests(URL), 1);
        assert_eq!(sink.take(), data);
    }

    #[tokio::test]
    async fn test_below_split_threshold_uses_one_extra_connection() {
        let data = pattern(64 * 1024);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(URL, ServedResource::new(data.clone()));

        let sink = Arc::new(MemorySink::new());
        let report = downloader(transport.clone())
            .download(&job(), sink.clone())
            .await
            .unwrap();
        assert_eq!(report.connections, 2);
        assert_eq!(sink.take(), data);
    }

    #[tokio::test]
    async fn test_range_mismatch_restarts_single_connection() {
        let data = pattern(200 * 1024);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(URL, ServedResource::new(data.clone()).misreporting_ranges());

        let sink = Arc::new(MemorySink::new());
        let report = downloader(transport.clone())
            .download(&job(), sink.clone())
            .await
            .unwrap();
        assert!(report.restarted);
        assert_eq!(report.connections, 1);
        assert_eq!(sink.take(), data);
        // probe + first sub-range + full restart
        assert_eq!(transport.requests(URL), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_speed_abort() {
        // 256 bytes every 500ms per connection
        let data = pattern(100 * 1024);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(
            URL,
            ServedResource::new(data).throttled(256, Duration::from_millis(500)),
        );

        let mut job = job();
        job.low_speed = LowSpeedConfigure::new(
            NetworkClass::Wifi,
            Duration::from_secs(1),
            Duration::from_secs(5),
            4 * 1024,
        )
        .unwrap();

        let started = Instant::now();
        let result = downloader(transport)
            .download(&job, Arc::new(MemorySink::new()))
            .await;
        let elapsed = started.elapsed();

        assert_matches!(result, Err(Error::LowSpeedAbort { .. }));
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_relaxes_low_speed_rule() {
        // 256 bytes every 500ms: 20KB takes ~40s on one connection
        let data = pattern(20 * 1024);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(
            URL,
            ServedResource::new(data.clone())
                .without_ranges()
                .throttled(256, Duration::from_millis(500)),
        );

        let flag = Arc::new(AtomicBool::new(false));
        let mut job = job();
        job.low_speed = LowSpeedConfigure::new(
            NetworkClass::Wifi,
            Duration::from_secs(1),
            Duration::from_secs(5),
            4 * 1024,
        )
        .unwrap();
        job.escalation = Some(Escalation {
            flag: flag.clone(),
            low_speed: LowSpeedConfigure::new(
                NetworkClass::Indispensable,
                Duration::from_secs(10),
                Duration::from_secs(120),
                1,
            )
            .unwrap(),
        });
        flag.store(true, Ordering::Release);

        let sink = Arc::new(MemorySink::new());
        let report = downloader(transport)
            .download(&job, sink.clone())
            .await
            .unwrap();
        assert_eq!(report.bytes, data.len() as u64);
        assert_eq!(sink.take(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tears_down() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(
            URL,
            ServedResource::new(pattern(10_000)).throttled(100, Duration::from_secs(1)),
        );

        let job = job();
        let cancel = job.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });

        let result = downloader(transport)
            .download(&job, Arc::new(MemorySink::new()))
            .await;
        assert_matches!(result, Err(Error::Canceled));
    }

    #[tokio::test]
    async fn test_length_limit() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(URL, ServedResource::new(pattern(5000)));

        let mut job = job();
        job.length_limit = Some(1000);
        let result = downloader(transport.clone())
            .download(&job, Arc::new(MemorySink::new()))
            .await;
        assert_matches!(
            result,
            Err(Error::DataLengthExceeded {
                size: 5000,
                limit: 1000
            })
        );

        // unknown size up front: enforced while streaming
        transport.serve(URL, ServedResource::new(pattern(5000)).without_ranges());
        let mut job = job;
        job.length_limit = Some(5000);
        assert!(downloader(transport)
            .download(&job, Arc::new(MemorySink::new()))
            .await
            .is_ok());
    }

    /// Claims a resource of almost `u64::MAX` bytes
    struct HugeTotal;

    #[async_trait::async_trait]
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

    #[tokio::test]
    async fn test_memory_sink_bounds_advertised_total() {
        let downloader = MultiConnectionDownloader::new(
            Arc::new(HugeTotal),
            Arc::new(SpeedRecorder::default()),
            DownloaderConfig::default(),
        );
        let sink = Arc::new(MemorySink::with_limit(4096));
        let result = downloader.download(&job(), sink.clone()).await;
        assert_matches!(
            result,
            Err(Error::DataLengthExceeded {
                size: 18446744073709551000,
                limit: 4096
            })
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_memory_sink_bounds_whole_reply() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(URL, ServedResource::new(pattern(5000)).without_ranges());
        let result = downloader(transport)
            .download(&job(), Arc::new(MemorySink::with_limit(1000)))
            .await;
        assert_matches!(result, Err(Error::DataLengthExceeded { limit: 1000, .. }));
    }

    #[tokio::test]
    async fn test_http_error_propagates() {
        let transport = Arc::new(InMemoryTransport::new());
        let result = downloader(transport)
            .download(&job(), Arc::new(MemorySink::new()))
            .await;
        assert_matches!(result, Err(Error::HttpStatus { status: 404, .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_optimal_connections_is_argmin(
            total in 1u64..(64 << 20),
            latency_ms in 0u64..2000,
            speed in 1u64..(8 << 20),
            max in 1usize..12,
        ) {
            let latency = Duration::from_millis(latency_ms);
            let chosen = optimal_connections(total, latency, speed, 1, max);
            prop_assert!((1..=max).contains(&chosen));
            let best = estimated_time(total, latency, speed, chosen);
            for n in 1..=max {
                prop_assert!(best <= estimated_time(total, latency, speed, n));
            }
        }
    }
}
