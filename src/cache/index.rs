//! Disk LRU Index
//!
//! Tracks every committed disk record: key, backing file, size and access
//! order. Persisted as `index.json` so LRU order survives a restart.
//!
//! # Lifecycle
//!
//! - Loaded on open and reconciled against the files actually present
//! - Kept in sync via `record()`, `touch()`, `remove()` by the disk tier
//! - Written back after every mutation that changes membership
//!
//! Not synchronized on its own; the disk tier owns it behind a mutex.

use std::path::Path;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::entry::CacheKey;
use crate::error::Result;

const INDEX_FORMAT_VERSION: u32 = 1;

/// Extension of committed content files
pub(crate) const DATA_EXTENSION: &str = "data";

/// Name of the content file for `key`, relative to the cache root
pub(crate) fn content_file_name(key: &CacheKey) -> String {
    format!("{}.{}", key, DATA_EXTENSION)
}

/// One committed content file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: String,
    /// File name relative to the cache root
    pub file: String,
    pub size: u64,
    /// Monotonic access sequence; higher is more recent
    pub access_seq: u64,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    /// Least recently used first
    records: Vec<DiskRecord>,
}

/// In-memory LRU of disk records
pub struct DiskIndex {
    records: LruCache<CacheKey, DiskRecord>,
    total_size: u64,
    next_seq: u64,
}

impl DiskIndex {
    pub fn new() -> Self {
        Self {
            records: LruCache::unbounded(),
            total_size: 0,
            next_seq: 0,
        }
    }

    /// Read a persisted index. A missing file yields an empty index; an
    /// unreadable one is an error the caller may choose to discard.
    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::new();
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };
        let mut file: IndexFile = serde_json::from_slice(&raw)?;
        file.records.sort_by_key(|r| r.access_seq);
        for record in file.records {
            let Some(key) = CacheKey::from_hex(&record.key) else {
                continue;
            };
            if record.file != content_file_name(&key) {
                warn!(key = %key.short(), file = %record.file, "Dropping index record with foreign file name");
                continue;
            }
            index.next_seq = index.next_seq.max(record.access_seq + 1);
            index.total_size += record.size;
            if let Some(old) = index.records.put(key, record) {
                index.total_size -= old.size;
            }
        }
        Ok(index)
    }

    /// Write the index atomically (temp file + rename)
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = IndexFile {
            version: INDEX_FORMAT_VERSION,
            records: self.records.iter().rev().map(|(_, r)| r.clone()).collect(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Insert or replace a record as most recently used. Returns the replaced
    /// record, if any.
    pub fn record(&mut self, key: CacheKey, file: String, size: u64) -> Option<DiskRecord> {
        let record = DiskRecord {
            key: key.as_str().to_string(),
            file,
            size,
            access_seq: self.bump(),
            last_access: Utc::now(),
        };
        self.total_size += size;
        let old = self.records.put(key, record);
        if let Some(old) = &old {
            self.total_size -= old.size;
        }
        old
    }

    /// Mark a record as most recently used
    pub fn touch(&mut self, key: &CacheKey) -> Option<DiskRecord> {
        let seq = self.next_seq;
        let record = self.records.get_mut(key)?;
        record.access_seq = seq;
        record.last_access = Utc::now();
        let snapshot = record.clone();
        self.next_seq += 1;
        Some(snapshot)
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<DiskRecord> {
        let record = self.records.pop(key)?;
        self.total_size -= record.size;
        Some(record)
    }

    /// Pop least recently used records until `incoming` more bytes fit in
    /// `budget`. `protect` is never evicted.
    pub fn evict_to_fit(
        &mut self,
        incoming: u64,
        budget: u64,
        protect: Option<&CacheKey>,
    ) -> Vec<DiskRecord> {
        let mut evicted = Vec::new();
        let mut skipped = Vec::new();
        while self.total_size + incoming > budget {
            let Some((key, record)) = self.records.pop_lru() else {
                break;
            };
            if protect == Some(&key) {
                skipped.push((key, record));
                continue;
            }
            self.total_size -= record.size;
            evicted.push(record);
        }
        // protected record goes back at the cold end, where it was
        for (key, record) in skipped {
            self.records.push(key.clone(), record);
            self.records.demote(&key);
        }
        evicted
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.contains(key)
    }

    pub fn peek(&self, key: &CacheKey) -> Option<&DiskRecord> {
        self.records.peek(key)
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<CacheKey> {
        self.records.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &DiskRecord> {
        self.records.iter().map(|(_, r)| r)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) -> Vec<DiskRecord> {
        let mut all = Vec::with_capacity(self.records.len());
        while let Some((_, record)) = self.records.pop_lru() {
            all.push(record);
        }
        self.total_size = 0;
        all
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl Default for DiskIndex {
    fn default() -> Self {
        Self::new()
    }
}
