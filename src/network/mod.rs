//! Network tier
//!
//! - [`transport`] - HTTP seam (`reqwest`) and the in-memory test server
//! - [`downloader`] - probe-sized multi-connection downloads
//! - [`strategy`] - low-speed abort policy per network class
//! - [`group`] - one physical fetch per cache key
//! - [`tier`] - the network tier worker tying them together

pub mod downloader;
pub mod group;
pub mod range;
pub mod speed;
pub mod strategy;
pub mod tier;
pub mod transport;

pub use downloader::{
    estimated_time, optimal_connections, DownloadJob, DownloadReport, DownloaderConfig,
    Escalation, MultiConnectionDownloader,
};
pub use group::{FetchTicket, GroupRegistry, Join};
pub use range::{parse_content_range, partition, ByteRange, RangeReply};
pub use speed::{SpeedRecorder, DEFAULT_CONNECTION_SPEED};
pub use strategy::{
    LowSpeedConfigure, LowSpeedReason, LowSpeedStrategy, NetworkClass, SpeedVerdict, SpeedWatch,
};
pub use tier::{HistoryRedirect, NetworkSettings, NetworkTier};
pub use transport::{
    FetchResponse, InMemoryTransport, ReqwestTransport, ServedResource, Timeouts, Transport,
    MAX_REDIRECTS,
};
