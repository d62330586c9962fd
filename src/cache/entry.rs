//! Cache Entry Types
//!
//! The content-addressed key shared by every tier and the memory tier's entry
//! record.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::decode::Resource;
use crate::error::{Error, Result};
use crate::request::{LoadParams, SourceType};

/// Bumped whenever the digest input layout changes; old disk records then
/// simply stop matching.
const KEY_DERIVATION_VERSION: &[u8] = b"tierfetch-key-v1\0";

/// Hex length of a SHA-256 digest
const KEY_HEX_LEN: usize = 64;

/// Cache key - SHA-256 of the resource identifier and its load parameters
///
/// Stable across process restarts, so disk records stay addressable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Derive the key for `resource_id` loaded with `params`
    ///
    /// Every field that changes the decoded result goes into the digest;
    /// `indispensable` does not, so urgent and relaxed requests share a key.
    pub fn derive(resource_id: &str, params: &LoadParams) -> Result<Self> {
        validate_resource_id(resource_id, params.source)?;

        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_VERSION);
        hasher.update([params.source.tag()]);
        // length prefix keeps the id from bleeding into the numeric fields
        hasher.update((resource_id.len() as u64).to_le_bytes());
        hasher.update(resource_id.as_bytes());
        hasher.update(params.width.to_le_bytes());
        hasher.update(params.height.to_le_bytes());
        hasher.update([params.pixel_format.tag()]);

        Ok(Self(Arc::from(format!("{:x}", hasher.finalize()))))
    }

    /// Rebuild a key read back from the persisted disk index
    pub(crate) fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == KEY_HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(Arc::from(hex)))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_resource_id(resource_id: &str, source: SourceType) -> Result<()> {
    if resource_id.trim().is_empty() {
        return Err(Error::InvalidRequest("resource id is empty".into()));
    }
    if resource_id.chars().any(char::is_control) {
        return Err(Error::InvalidRequest(
            "resource id contains control characters".into(),
        ));
    }
    if source == SourceType::Http {
        let lower = resource_id.get(..8).unwrap_or(resource_id).to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(Error::InvalidRequest(format!(
                "not an http(s) url: {}",
                resource_id
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Memory Entry
// =============================================================================

/// Memory tier record: key, decoded resource and its in-use flag
///
/// An entry is freed only while `in_use` is false; otherwise eviction moves
/// it to quarantine.
pub struct MemoryEntry {
    pub key: CacheKey,
    pub resource: Arc<dyn Resource>,
    pub size: u64,
    pub in_use: bool,
    pub inserted_at: Instant,
}

impl MemoryEntry {
    pub fn new(key: CacheKey, resource: Arc<dyn Resource>, in_use: bool) -> Self {
        let size = resource.byte_size();
        Self {
            key,
            resource,
            size,
            in_use,
            inserted_at: Instant::now(),
        }
    }
}

impl fmt::Debug for MemoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntry")
            .field("key", &self.key.short())
            .field("size", &self.size)
            .field("in_use", &self.in_use)
            .finish()
    }
}
