//! Positional byte sinks
//!
//! The downloader writes every block at its absolute offset, so the same
//! transfer can land in a staged disk file or in a memory buffer.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use bytes::Bytes;
use parking_lot::Mutex;

/// Default cap on a single in-memory download
pub const DEFAULT_MEMORY_SINK_LIMIT: u64 = 64 * 1024 * 1024;

/// Upper bound on what a length hint may reserve up front
const MAX_RESERVE: u64 = 1024 * 1024;

/// Destination of a download
pub trait ByteSink: Send + Sync {
    /// Discard anything written so far
    ///
    /// `len` comes from response headers and is only a hint; sinks grow as
    /// bytes actually arrive.
    fn reset(&self, len: Option<u64>) -> io::Result<()>;

    /// Write `data` starting at absolute `offset`
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Largest resource this sink accepts, if bounded
    fn max_len(&self) -> Option<u64> {
        None
    }
}

fn too_large() -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, "buffer limit exceeded")
}

/// File-backed sink; blocks seek to their own offset
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl ByteSink for FileSink {
    fn reset(&self, _len: Option<u64>) -> io::Result<()> {
        self.file.lock().set_len(0)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}

/// Memory-backed sink used while the disk tier is unhealthy
#[derive(Debug)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
    limit: u64,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MEMORY_SINK_LIMIT)
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that refuses to grow past `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the buffered bytes, leaving the sink empty
    pub fn take(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.buf.lock()))
    }
}

impl ByteSink for MemorySink {
    fn reset(&self, len: Option<u64>) -> io::Result<()> {
        let mut buf = self.buf.lock();
        buf.clear();
        if let Some(len) = len {
            let reserve = len.min(MAX_RESERVE).min(self.limit) as usize;
            buf.reserve(reserve);
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.limit)
            .ok_or_else(too_large)?;
        let (start, end) = (offset as usize, end as usize);
        let mut buf = self.buf.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn max_len(&self) -> Option<u64> {
        Some(self.limit)
    }
}
