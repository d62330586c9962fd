//! Error types for the tiered loader

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving a resource through the tiers
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed load request; never retried
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No tier could produce the resource, e.g. a missing local file
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error, reported before any task executes
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Disk Tier Errors
    // =========================================================================
    /// Disk read/write failure; absorbed by the memory-buffer fallback
    #[error("Disk I/O error during {op}: {source}")]
    DiskIo {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Another writer holds the lease for this key
    #[error("Disk write already in progress for key {0}")]
    WriteInProgress(String),

    // =========================================================================
    // Network Tier Errors
    // =========================================================================
    /// Connection, protocol or stream failure
    #[error("Network error for {url}: {reason}")]
    Network { url: String, reason: String },

    /// Server answered with a non-success status
    #[error("HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// HTTP client error
    #[error("HTTP transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Connect, read or caller-facing timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Throughput could not meet the low-speed deadline
    #[error("Network too slow: {speed_bps} B/s after {elapsed:?} ({reason})")]
    LowSpeedAbort {
        elapsed: Duration,
        speed_bps: u64,
        reason: String,
    },

    /// Resource is larger than the configured data length limit
    #[error("Resource of {size} bytes exceeds the {limit} byte limit")]
    DataLengthExceeded { size: u64, limit: u64 },

    /// Every waiter withdrew before the load finished
    #[error("Load canceled")]
    Canceled,

    // =========================================================================
    // Decode / Memory Errors
    // =========================================================================
    /// Propagated from the decoder collaborator
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Quarantine overflow: callers are not releasing resources
    #[error("Quarantine overflow: {quarantined} bytes held against a {budget} byte budget")]
    CapacityExceeded { quarantined: u64, budget: u64 },
}

impl Error {
    /// Build a disk error for the given operation
    pub fn disk(op: &'static str, source: std::io::Error) -> Self {
        Error::DiskIo { op, source }
    }

    /// Build a network error for the given URL
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// True for connection, status, transport and timeout failures
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network { .. }
                | Error::HttpStatus { .. }
                | Error::Transport(_)
                | Error::Timeout(_)
        )
    }

    /// True when the fetch was aborted by the low-speed strategy
    pub fn is_low_speed(&self) -> bool {
        matches!(self, Error::LowSpeedAbort { .. })
    }

    /// True for failures local to the disk tier
    pub fn is_disk(&self) -> bool {
        matches!(self, Error::DiskIo { .. } | Error::WriteInProgress(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Whether a fresh attempt may succeed; bad requests and oversized
    /// resources fail the same way every time
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidRequest(_)
                | Error::Config(_)
                | Error::DataLengthExceeded { .. }
                | Error::Decode(_)
                | Error::CapacityExceeded { .. }
        )
    }
}
