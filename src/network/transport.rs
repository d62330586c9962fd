//! Network Transport
//!
//! The downloader talks to servers through the [`Transport`] trait so the
//! engine can be driven by a real HTTP client or an in-memory server.
//!
//! - [`ReqwestTransport`]: HTTP(S) via reqwest with at most
//!   [`MAX_REDIRECTS`] redirects
//! - [`InMemoryTransport`]: serves registered byte buffers, with optional
//!   throttling, latency and range misbehaviour (for testing and offline runs)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use tracing::{debug, trace};

use super::range::ByteRange;
use crate::error::{Error, Result};

/// Redirects followed before giving up
pub const MAX_REDIRECTS: usize = 5;

/// Default User-Agent string for HTTP requests
const DEFAULT_USER_AGENT: &str = concat!("tierfetch/", env!("CARGO_PKG_VERSION"));

/// Body chunks as they arrive
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Connect and read timeouts for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed until response headers
    pub connect: Duration,
    /// Time allowed between body chunks
    pub read: Duration,
}

impl Timeouts {
    pub fn new(connect: Duration, read: Duration) -> Self {
        Self { connect, read }
    }

    /// Doubled timeouts for indispensable transfers
    pub fn relaxed(self) -> Self {
        Self {
            connect: self.connect * 2,
            read: self.read * 2,
        }
    }

    /// Caller-facing timeout absorbing dedup and group-wait latency
    pub fn caller_timeout(&self, factor: u32) -> Duration {
        (self.connect + self.read) * factor
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000), Duration::from_millis(5000))
    }
}

/// Response headers plus the streaming body
pub struct FetchResponse {
    pub status: u16,
    /// Raw `Content-Range` value, if any
    pub content_range: Option<String>,
    /// Length of this body (not necessarily of the resource)
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Source of resource bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`, optionally restricted to `range`. Non-success statuses are
    /// errors.
    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
        timeouts: Timeouts,
    ) -> Result<FetchResponse>;
}

// =============================================================================
// Reqwest Transport
// =============================================================================

/// HTTP transport backed by reqwest
///
/// Clients are cached per connect timeout, since reqwest fixes it at build
/// time and indispensable transfers use a doubled one.
pub struct ReqwestTransport {
    clients: DashMap<Duration, reqwest::Client>,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            clients: DashMap::new(),
            user_agent: user_agent.into(),
        }
    }

    fn client(&self, connect_timeout: Duration) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(&connect_timeout) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(&self.user_agent)
            .build()
            .map_err(Error::Transport)?;
        self.clients.insert(connect_timeout, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
        timeouts: Timeouts,
    ) -> Result<FetchResponse> {
        let mut request = self.client(timeouts.connect)?.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let header_deadline = timeouts.connect + timeouts.read;
        let response = tokio::time::timeout(header_deadline, request.send())
            .await
            .map_err(|_| Error::Timeout(header_deadline))?
            .map_err(Error::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        debug!(url, status = status.as_u16(), ?content_range, ?content_length, "Response headers");

        Ok(FetchResponse {
            status: status.as_u16(),
            content_range,
            content_length,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(Error::Transport))
                .boxed(),
        })
    }
}

// =============================================================================
// In-Memory Transport
// =============================================================================

/// A resource served by [`InMemoryTransport`]
#[derive(Debug, Clone)]
pub struct ServedResource {
    pub data: Bytes,
    /// Honor `Range` requests with `206` replies
    pub accept_ranges: bool,
    /// Answer non-zero ranges with a wrong `Content-Range`
    pub misreport_ranges: bool,
    pub chunk_size: usize,
    /// Delay before each body chunk
    pub chunk_delay: Duration,
    /// Delay before headers
    pub latency: Duration,
    pub status: u16,
}

impl ServedResource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            accept_ranges: true,
            misreport_ranges: false,
            chunk_size: 8 * 1024,
            chunk_delay: Duration::ZERO,
            latency: Duration::ZERO,
            status: 200,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn misreporting_ranges(mut self) -> Self {
        self.misreport_ranges = true;
        self
    }

    /// Deliver `chunk_size` bytes every `delay`
    pub fn throttled(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// In-memory server keyed by URL
#[derive(Default)]
pub struct InMemoryTransport {
    resources: DashMap<String, ServedResource>,
    requests: DashMap<String, usize>,
    ranged: DashMap<String, usize>,
    total: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: impl Into<String>, resource: ServedResource) {
        self.resources.insert(url.into(), resource);
    }

    pub fn remove(&self, url: &str) {
        self.resources.remove(url);
    }

    /// Requests made for `url`, ranged or not
    pub fn requests(&self, url: &str) -> usize {
        self.requests.get(url).map_or(0, |n| *n)
    }

    /// Requests for `url` that carried a `Range`
    pub fn ranged_requests(&self, url: &str) -> usize {
        self.ranged.get(url).map_or(0, |n| *n)
    }

    /// Requests made for any URL
    pub fn total_requests(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
        timeouts: Timeouts,
    ) -> Result<FetchResponse> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.requests.entry(url.to_string()).or_insert(0) += 1;
        if range.is_some() {
            *self.ranged.entry(url.to_string()).or_insert(0) += 1;
        }

        let served = self.resources.get(url).map(|r| r.clone());
        let Some(served) = served else {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: 404,
            });
        };

        if !served.latency.is_zero() {
            let header_deadline = timeouts.connect + timeouts.read;
            if served.latency > header_deadline {
                tokio::time::sleep(header_deadline).await;
                return Err(Error::Timeout(header_deadline));
            }
            tokio::time::sleep(served.latency).await;
        }
        if !(200..300).contains(&served.status) {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: served.status,
            });
        }

        let len = served.data.len() as u64;
        let (status, body, content_range) = match range {
            Some(range) if served.accept_ranges => {
                if range.start >= len {
                    return Err(Error::HttpStatus {
                        url: url.to_string(),
                        status: 416,
                    });
                }
                let end = range.end.min(len - 1);
                let body = served.data.slice(range.start as usize..=end as usize);
                let reported_start = if served.misreport_ranges && range.start > 0 {
                    0
                } else {
                    range.start
                };
                let header = format!("bytes {}-{}/{}", reported_start, end, len);
                (206, body, Some(header))
            }
            _ => (200, served.data.clone(), None),
        };
        trace!(url, ?range, status, bytes = body.len(), "Serving in-memory resource");

        let content_length = Some(body.len() as u64);
        Ok(FetchResponse {
            status,
            content_range,
            content_length,
            body: chunked(body, served.chunk_size, served.chunk_delay),
        })
    }
}

fn chunked(data: Bytes, chunk_size: usize, delay: Duration) -> BodyStream {
    stream::unfold((data, 0usize), move |(data, offset)| async move {
        if offset >= data.len() {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let end = (offset + chunk_size).min(data.len());
        let chunk = data.slice(offset..end);
        Some((Ok(chunk), (data, end)))
    })
    .boxed()
}
