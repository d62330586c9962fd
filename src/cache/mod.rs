//! Cache Tiers
//!
//! Storage side of the loader: the memory tier of decoded resources, the disk
//! tier of raw bytes, and the history ring that links them to the network.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         CacheKey (SHA-256)                           │
//! ├──────────────────────────┬───────────────────────┬───────────────────┤
//! │ Memory Tier              │ Disk Tier             │ History Ring      │
//! │ ┌──────────────────────┐ │ ┌───────────────────┐ │ ┌───────────────┐ │
//! │ │ LRU by bytes         │ │ │ <key>.data files  │ │ │ last N network│ │
//! │ │ + quarantine for     │ │ │ + index.json LRU  │ │ │ successes     │ │
//! │ │   in-use evictions   │ │ │ + DiskHealth flag │ │ └───────────────┘ │
//! │ └──────────────────────┘ │ └───────────────────┘ │                   │
//! └──────────────────────────┴───────────────────────┴───────────────────┘
//! ```
//!
//! Each structure is owned by one component and mutated only through its
//! public operations under its own lock.

mod disk;
mod entry;
mod health;
mod history;
mod index;
mod memory;
mod metrics;

pub use disk::{CommittedFile, DiskConfig, DiskStats, DiskTier, DiskWriter, DEFAULT_DISK_BUDGET};
pub use entry::{CacheKey, MemoryEntry};
pub use health::DiskHealth;
pub use history::{HistoryRing, DEFAULT_HISTORY_CAPACITY};
pub use index::{DiskIndex, DiskRecord};
pub use memory::{
    CapacityAlert, MemoryConfig, MemoryStats, MemoryTier, DEFAULT_MEMORY_BUDGET,
    DEFAULT_QUARANTINE_BUDGET,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
