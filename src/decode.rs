//! Decoder Collaborator Contract
//!
//! The engine never interprets resource bytes itself. A [`Decoder`] turns a
//! committed disk file or an in-memory buffer into a [`Resource`], and the
//! memory tier accounts for it by [`Resource::byte_size`]. When the memory
//! tier frees an entry it calls [`Resource::release`] so large payloads are
//! dropped deterministically instead of whenever the last `Arc` goes away.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::request::LoadParams;

/// A decoded, displayable resource
pub trait Resource: Send + Sync + 'static {
    /// Bytes charged against the memory budget
    fn byte_size(&self) -> u64;

    /// Drop the underlying payload. Called once, when the memory tier frees
    /// the entry.
    fn release(&self);

    /// Downcast support for callers that know the concrete type
    fn as_any(&self) -> &dyn Any;
}

/// Raw input handed to the decoder
#[derive(Debug, Clone)]
pub enum DecodeInput {
    /// Committed disk cache file, or a local source file
    File(PathBuf),
    /// Memory buffer (disk tier unhealthy)
    Bytes(Bytes),
}

/// Turns raw bytes into a [`Resource`]. Runs on the blocking pool.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, input: DecodeInput, params: &LoadParams) -> Result<Arc<dyn Resource>>;
}

/// Run `decoder` on the blocking pool
pub(crate) async fn decode_blocking(
    decoder: Arc<dyn Decoder>,
    input: DecodeInput,
    params: LoadParams,
) -> Result<Arc<dyn Resource>> {
    tokio::task::spawn_blocking(move || decoder.decode(input, &params))
        .await
        .map_err(|e| Error::Decode(format!("decoder panicked: {}", e)))?
}

// =============================================================================
// Built-in resource
// =============================================================================

/// Byte payload resource
#[derive(Debug)]
pub struct Blob {
    data: RwLock<Option<Bytes>>,
    size: u64,
}

impl Blob {
    pub fn new(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self {
            data: RwLock::new(Some(data)),
            size,
        }
    }

    /// Payload, or `None` once released
    pub fn bytes(&self) -> Option<Bytes> {
        self.data.read().clone()
    }

    pub fn is_released(&self) -> bool {
        self.data.read().is_none()
    }
}

impl Resource for Blob {
    fn byte_size(&self) -> u64 {
        self.size
    }

    fn release(&self) {
        self.data.write().take();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Decoder that keeps the raw bytes as a [`Blob`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    fn decode(&self, input: DecodeInput, _params: &LoadParams) -> Result<Arc<dyn Resource>> {
        let data = match input {
            DecodeInput::File(path) => std::fs::read(&path)
                .map(Bytes::from)
                .map_err(|e| Error::Decode(format!("{}: {}", path.display(), e)))?,
            DecodeInput::Bytes(bytes) => bytes,
        };
        Ok(Arc::new(Blob::new(data)))
    }
}
