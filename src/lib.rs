//! tierfetch - Tiered Resource Cache-and-Load Engine
//!
//! Resolves a resource identifier into a decoded in-memory resource by
//! querying a memory cache, a disk cache and finally the network, with
//! bounded concurrency per tier, one physical fetch per cache key, and
//! adaptive handling of slow or failing networks.
//!
//! # Architecture
//!
//! ```text
//!   load() ──► Memory Engine ──miss──► Disk Engine ──miss──► Network Engine
//!                 │ hit                  │ hit   ▲  history     │ dedup by key
//!                 ▼                      ▼       └──redirect────┤ multi-connection
//!              ───────────── outcome to every waiter ◄──────────┘ download → disk → memory
//! ```
//!
//! # Modules
//!
//! - [`cache`] - cache keys, memory tier with quarantine, disk tier with LRU index
//! - [`network`] - transport, multi-connection downloader, low-speed strategy, fetch groups
//! - [`engine`] - task state machine, tier dispatchers and routing
//! - [`loader`] - caller-facing [`Loader`], handles and configuration
//! - [`decode`] - decoder and resource contracts
//! - [`error`] - Error types

pub mod cache;
pub mod decode;
pub mod engine;
pub mod error;
pub mod loader;
pub mod network;
pub mod request;
pub mod sink;

// Re-export commonly used types
pub use cache::{CacheKey, CapacityAlert, MetricsSnapshot};
pub use decode::{Blob, DecodeInput, Decoder, PassthroughDecoder, Resource};
pub use engine::Tier;
pub use error::{Error, Result};
pub use loader::{LoadHandle, LoadOutcome, Loader, LoaderConfig, ResourceHandle};
pub use network::{HistoryRedirect, NetworkClass, Transport};
pub use request::{LoadParams, LoadRequest, PixelFormat, SourceType};
