//! Disk Tier - persistent LRU of raw resource bytes
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── index.json              LRU index (key, file, size, access order)
//! ├── <key>.data              one committed content file per key
//! └── tmp/<key>.<uuid>.tmp    staged writes, published by rename
//! ```
//!
//! # Design
//!
//! - Writes stage into `tmp/` and publish atomically on commit; abort, or
//!   dropping an unfinished writer, discards the staged file.
//! - One write lease per key; a second `begin_write` for the same key fails.
//! - Eviction is pure LRU by total bytes and runs synchronously inside
//!   `begin_write` (for the announced size) and `commit` (for the real size).
//! - Failures flip the shared [`DiskHealth`] flag; a successful commit flips
//!   it back.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::CacheKey;
use super::health::DiskHealth;
use super::index::{content_file_name, DiskIndex, DiskRecord, DATA_EXTENSION};
use crate::error::{Error, Result};
use crate::sink::FileSink;

/// Default disk budget (100MB)
pub const DEFAULT_DISK_BUDGET: u64 = 100 * 1024 * 1024;

const INDEX_FILE: &str = "index.json";
const STAGING_DIR: &str = "tmp";

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Writable cache directory
    pub root: PathBuf,
    /// Maximum total bytes of committed files
    pub budget: u64,
}

impl DiskConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            budget: DEFAULT_DISK_BUDGET,
        }
    }
}

/// Disk tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub healthy: bool,
}

/// Disk Tier - bounded on-disk LRU
pub struct DiskTier {
    root: PathBuf,
    staging: PathBuf,
    index_path: PathBuf,
    budget: u64,
    index: Mutex<DiskIndex>,
    leases: DashMap<CacheKey, ()>,
    health: DiskHealth,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskTier {
    /// Open (or create) the cache directory and reconcile the index with the
    /// files actually present
    pub fn open(config: DiskConfig, health: DiskHealth) -> Result<Arc<Self>> {
        let root = config.root;
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| Error::disk("open", e))?;
        clear_dir(&staging);

        let index_path = root.join(INDEX_FILE);
        let mut index = DiskIndex::load(&index_path).unwrap_or_else(|e| {
            warn!(error = %e, "Disk index unreadable, starting empty");
            DiskIndex::new()
        });

        let missing: Vec<CacheKey> = index
            .keys_lru_order()
            .into_iter()
            .filter(|key| {
                index
                    .peek(key)
                    .map_or(true, |record| !root.join(&record.file).is_file())
            })
            .collect();
        for key in &missing {
            index.remove(key);
        }

        let orphans = remove_orphans(&root, &index);
        let over_budget = index.evict_to_fit(0, config.budget, None);

        let tier = Self {
            root,
            staging,
            index_path,
            budget: config.budget,
            index: Mutex::new(index),
            leases: DashMap::new(),
            health,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        tier.delete_files(&over_budget);
        {
            let index = tier.index.lock();
            tier.persist(&index);
            info!(
                root = %tier.root.display(),
                entries = index.len(),
                bytes = index.total_size(),
                budget = tier.budget,
                dropped = missing.len(),
                orphans,
                "Disk cache opened"
            );
        }
        Ok(Arc::new(tier))
    }

    /// Path of the committed file for `key`, touching its recency
    pub fn read(&self, key: &CacheKey) -> Option<PathBuf> {
        let mut index = self.index.lock();
        let Some(record) = index.touch(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let path = self.root.join(&record.file);
        if path.is_file() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(path)
        } else {
            debug!(key = %key.short(), "Disk record without file, dropping");
            index.remove(key);
            self.persist(&index);
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Start staging a write for `key`
    ///
    /// When `expected_size` is known, least recently used records are evicted
    /// now so the new file fits.
    pub fn begin_write(
        self: &Arc<Self>,
        key: &CacheKey,
        expected_size: Option<u64>,
    ) -> Result<DiskWriter> {
        match self.leases.entry(key.clone()) {
            Entry::Occupied(_) => return Err(Error::WriteInProgress(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        if let Some(size) = expected_size {
            let evicted = self.index.lock().evict_to_fit(size, self.budget, None);
            if !evicted.is_empty() {
                self.delete_files(&evicted);
                self.persist(&self.index.lock());
            }
        }

        let staging = self
            .staging
            .join(format!("{}.{}.tmp", key, Uuid::new_v4().simple()));
        match File::create(&staging) {
            Ok(file) => Ok(DiskWriter {
                tier: self.clone(),
                key: key.clone(),
                staging,
                file: Some(file),
                written: 0,
                finished: false,
            }),
            Err(e) => {
                self.leases.remove(key);
                self.health.mark_unhealthy("staging file could not be created");
                Err(Error::disk("begin_write", e))
            }
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> &DiskHealth {
        &self.health
    }

    /// Whether a record exists, without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().contains(key)
    }

    /// Drop one record and its file
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut index = self.index.lock();
        let Some(record) = index.remove(key) else {
            return Ok(false);
        };
        remove_file_if_present(&self.root.join(&record.file))
            .map_err(|e| Error::disk("remove", e))?;
        self.persist(&index);
        Ok(true)
    }

    /// Delete every record, content file and staged write
    ///
    /// Must not be called while loads are writing to the tier.
    pub fn wipe(&self) -> Result<()> {
        let mut index = self.index.lock();
        let records = index.clear();
        for record in &records {
            remove_file_if_present(&self.root.join(&record.file))
                .map_err(|e| Error::disk("wipe", e))?;
        }
        clear_dir(&self.staging);
        self.persist(&index);
        info!(removed = records.len(), "Disk cache wiped");
        Ok(())
    }

    pub fn stats(&self) -> DiskStats {
        let index = self.index.lock();
        DiskStats {
            entries: index.len(),
            total_bytes: index.total_size(),
            budget: self.budget,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        self.index.lock().keys_lru_order()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Publish a staged file under `key`
    fn publish(&self, key: &CacheKey, staging: &Path, size: u64) -> io::Result<CommittedFile> {
        if size > self.budget {
            // served once from staging, never indexed
            let path = staging.with_extension("serve");
            fs::rename(staging, &path)?;
            return Ok(CommittedFile {
                path,
                transient: true,
            });
        }

        let file_name = content_file_name(key);
        let path = self.root.join(&file_name);
        fs::rename(staging, &path)?;

        let mut index = self.index.lock();
        index.record(key.clone(), file_name, size);
        let evicted = index.evict_to_fit(0, self.budget, Some(key));
        self.delete_files(&evicted);
        self.persist(&index);
        Ok(CommittedFile {
            path,
            transient: false,
        })
    }

    fn delete_files(&self, records: &[DiskRecord]) {
        for record in records {
            if let Err(e) = remove_file_if_present(&self.root.join(&record.file)) {
                warn!(file = %record.file, error = %e, "Failed to delete evicted file");
            }
            debug!(file = %record.file, size = record.size, "Evicted disk record");
        }
        self.evictions
            .fetch_add(records.len() as u64, Ordering::Relaxed);
    }

    fn persist(&self, index: &DiskIndex) {
        if let Err(e) = index.persist(&self.index_path) {
            warn!(error = %e, "Failed to persist disk index");
        }
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        // flush access order gathered since the last membership change
        self.persist(&self.index.lock());
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Staged write for one key. Holds the key's write lease until committed,
/// aborted or dropped.
pub struct DiskWriter {
    tier: Arc<DiskTier>,
    key: CacheKey,
    staging: PathBuf,
    file: Option<File>,
    written: u64,
    finished: bool,
}

impl DiskWriter {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Bytes appended through [`DiskWriter::write`]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append bytes sequentially
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Internal("writer already finished".into()));
        };
        if let Err(e) = file.write_all(data) {
            self.tier.health.mark_unhealthy("write failed");
            return Err(Error::disk("write", e));
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Positional sink over the staged file for block-parallel downloads
    pub fn sink(&self) -> Result<FileSink> {
        let Some(file) = self.file.as_ref() else {
            return Err(Error::Internal("writer already finished".into()));
        };
        match file.try_clone() {
            Ok(clone) => Ok(FileSink::new(clone)),
            Err(e) => {
                self.tier.health.mark_unhealthy("staging handle could not be cloned");
                Err(Error::disk("sink", e))
            }
        }
    }

    /// Flush and atomically publish the staged file
    pub fn commit(mut self) -> Result<CommittedFile> {
        let Some(file) = self.file.take() else {
            return Err(Error::Internal("writer already finished".into()));
        };
        let size = file.sync_all().and_then(|_| file.metadata()).map(|m| m.len());
        drop(file);

        let published = size.and_then(|size| self.tier.publish(&self.key, &self.staging, size));
        self.finish();
        match published {
            Ok(committed) => {
                self.tier.health.mark_healthy();
                debug!(key = %self.key.short(), path = %committed.path.display(), "Disk write committed");
                Ok(committed)
            }
            Err(e) => {
                self.tier.health.mark_unhealthy("commit failed");
                Err(Error::disk("commit", e))
            }
        }
    }

    /// Discard the staged file
    pub fn abort(mut self) {
        self.file.take();
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // after a successful rename the staging path no longer exists
        let _ = remove_file_if_present(&self.staging);
        self.tier.leases.remove(&self.key);
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        self.file.take();
        self.finish();
    }
}

/// A committed file ready for decoding
///
/// Files larger than the whole disk budget are never indexed; they are served
/// once from staging and deleted when this value is dropped.
#[derive(Debug)]
pub struct CommittedFile {
    path: PathBuf,
    transient: bool,
}

impl CommittedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl Drop for CommittedFile {
    fn drop(&mut self) {
        if self.transient {
            let _ = remove_file_if_present(&self.path);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn clear_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let _ = fs::remove_file(entry.path());
    }
}

/// Delete `.data` files the index does not know about
fn remove_orphans(root: &Path, index: &DiskIndex) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let known: std::collections::HashSet<&str> =
        index.records().map(|r| r.file.as_str()).collect();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_data = path.extension().and_then(|e| e.to_str()) == Some(DATA_EXTENSION);
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_data && !known.contains(name) && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::LoadParams;
    use std::time::Duration;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(&format!("http://host/{}", name), &LoadParams::default()).unwrap()
    }

    fn open(root: &Path, budget: u64) -> Arc<DiskTier> {
        DiskTier::open(
            DiskConfig {
                root: root.to_path_buf(),
                budget,
            },
            DiskHealth::new(Duration::ZERO),
        )
        .unwrap()
    }

    fn store(tier: &Arc<DiskTier>, key: &CacheKey, size: usize) {
        let mut writer = tier.begin_write(key, Some(size as u64)).unwrap();
        writer.write(&vec![1u8; size]).unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn test_write_commit_read() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 1024);
        let a = key("a");

        assert!(tier.read(&a).is_none());

        let mut writer = tier.begin_write(&a, None).unwrap();
        writer.write(b"hello ").unwrap();
        writer.write(b"disk").unwrap();
        assert_eq!(writer.written(), 10);
        let committed = writer.commit().unwrap();
        assert!(!committed.is_transient());

        let path = tier.read(&a).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"hello disk");

        let stats = tier.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_abort_discards() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 1024);
        let a = key("a");

        let mut writer = tier.begin_write(&a, None).unwrap();
        writer.write(b"partial").unwrap();
        writer.abort();

        assert!(tier.read(&a).is_none());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
        // lease released
        assert!(tier.begin_write(&a, None).is_ok());
    }

    #[test]
    fn test_single_writer_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 1024);
        let a = key("a");

        let first = tier.begin_write(&a, None).unwrap();
        assert!(matches!(
            tier.begin_write(&a, None),
            Err(Error::WriteInProgress(_))
        ));
        drop(first);
        assert!(tier.begin_write(&a, None).is_ok());
    }

    #[test]
    fn test_budget_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 10);
        let (a, b, c) = (key("a"), key("b"), key("c"));

        store(&tier, &a, 4);
        store(&tier, &b, 4);
        store(&tier, &c, 4);

        assert_eq!(tier.keys(), vec![b.clone(), c.clone()]);
        assert!(tier.read(&a).is_none());
        assert_eq!(tier.stats().total_bytes, 8);
        assert_eq!(tier.stats().evictions, 1);
        assert!(!dir.path().join(format!("{}.data", a)).exists());
    }

    #[test]
    fn test_eviction_on_commit_with_unknown_size() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 10);
        let (a, b) = (key("a"), key("b"));

        store(&tier, &a, 6);
        let mut writer = tier.begin_write(&b, None).unwrap();
        writer.write(&[2u8; 6]).unwrap();
        writer.commit().unwrap();

        assert_eq!(tier.keys(), vec![b]);
        assert!(tier.stats().total_bytes <= 10);
    }

    #[test]
    fn test_oversized_commit_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 4);
        let a = key("a");

        let mut writer = tier.begin_write(&a, None).unwrap();
        writer.write(b"too large").unwrap();
        let committed = writer.commit().unwrap();

        assert!(committed.is_transient());
        assert_eq!(fs::read(committed.path()).unwrap(), b"too large");
        let path = committed.path().to_path_buf();
        drop(committed);
        assert!(!path.exists());
        assert!(!tier.contains(&a));
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (key("a"), key("b"));
        {
            let tier = open(dir.path(), 100);
            store(&tier, &a, 3);
            store(&tier, &b, 3);
            tier.read(&a);
        }

        // stray content file and staged leftovers are cleaned on open
        fs::write(dir.path().join(format!("{}.data", key("orphan"))), b"x").unwrap();
        fs::write(dir.path().join(STAGING_DIR).join("junk.tmp"), b"x").unwrap();

        let tier = open(dir.path(), 100);
        assert_eq!(tier.keys(), vec![b, a]);
        assert!(!dir.path().join(format!("{}.data", key("orphan"))).exists());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_reopen_with_smaller_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (key("a"), key("b"));
        {
            let tier = open(dir.path(), 100);
            store(&tier, &a, 5);
            store(&tier, &b, 5);
        }
        let tier = open(dir.path(), 6);
        assert_eq!(tier.keys(), vec![b]);
    }

    #[test]
    fn test_health_flag_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 1024);
        let staging = dir.path().join(STAGING_DIR);

        // staging directory replaced by a plain file: creation fails
        fs::remove_dir_all(&staging).unwrap();
        fs::write(&staging, b"not a directory").unwrap();
        assert!(matches!(
            tier.begin_write(&key("a"), None),
            Err(Error::DiskIo { .. })
        ));
        assert!(!tier.is_healthy());

        fs::remove_file(&staging).unwrap();
        fs::create_dir(&staging).unwrap();
        store(&tier, &key("a"), 4);
        assert!(tier.is_healthy());
        assert_eq!(tier.health().recoveries(), 1);
    }

    #[test]
    fn test_remove_and_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open(dir.path(), 100);
        let (a, b) = (key("a"), key("b"));
        store(&tier, &a, 4);
        store(&tier, &b, 4);

        assert!(tier.remove(&a).unwrap());
        assert!(!tier.remove(&a).unwrap());
        assert!(tier.contains(&b));

        tier.wipe().unwrap();
        assert_eq!(tier.stats().entries, 0);
        assert!(tier.read(&b).is_none());
    }
}
