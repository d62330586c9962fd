//! Caller-facing handles
//!
//! [`LoadHandle`] is the pending result of one `load()`; [`ResourceHandle`]
//! is a delivered resource. A resource handle refers back to the memory tier
//! weakly, so holding one never keeps the engine alive.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, MemoryTier};
use crate::decode::Resource;
use crate::engine::Tier;
use crate::error::Error;

/// Terminal result of a load, delivered exactly once per caller
#[derive(Clone)]
pub enum LoadOutcome {
    Succeed(ResourceHandle),
    Failed(Arc<Error>),
    Canceled,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadOutcome::Succeed(_))
    }

    pub fn handle(&self) -> Option<&ResourceHandle> {
        match self {
            LoadOutcome::Succeed(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            LoadOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Debug for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadOutcome::Succeed(handle) => f.debug_tuple("Succeed").field(handle).finish(),
            LoadOutcome::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
            LoadOutcome::Canceled => f.write_str("Canceled"),
        }
    }
}

/// A delivered resource plus a non-owning capability to release it
#[derive(Clone)]
pub struct ResourceHandle {
    key: CacheKey,
    resource: Arc<dyn Resource>,
    tier: Tier,
    memory: Weak<MemoryTier>,
}

impl ResourceHandle {
    pub(crate) fn new(
        key: CacheKey,
        resource: Arc<dyn Resource>,
        tier: Tier,
        memory: Weak<MemoryTier>,
    ) -> Self {
        Self {
            key,
            resource,
            tier,
            memory,
        }
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// Downcast the resource to the decoder's concrete type
    pub fn downcast<T: Resource>(&self) -> Option<&T> {
        self.resource.as_any().downcast_ref::<T>()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Tier that satisfied the load
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Tell the memory tier the resource is no longer displayed. No-op once
    /// the loader is gone.
    pub fn mark_unused(&self) -> bool {
        self.memory
            .upgrade()
            .is_some_and(|memory| memory.mark_unused(&self.key))
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key.short())
            .field("tier", &self.tier)
            .field("bytes", &self.resource.byte_size())
            .finish()
    }
}

/// Pending result of one load
///
/// Dropping the handle without waiting does not cancel the load; the result
/// is discarded and its resource marked unused.
pub struct LoadHandle {
    key: CacheKey,
    rx: oneshot::Receiver<LoadOutcome>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl LoadHandle {
    pub(crate) fn new(
        key: CacheKey,
        rx: oneshot::Receiver<LoadOutcome>,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            rx,
            cancel,
            shutdown,
            timeout,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Caller-facing timeout applied by [`LoadHandle::wait`]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Withdraw this caller. A shared fetch keeps running for other waiters.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this load, for callers that hand the handle away
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the outcome. Resolves to `Failed(Timeout)` and cancels the
    /// load once the caller timeout passes.
    pub async fn wait(self) -> LoadOutcome {
        let LoadHandle {
            mut rx,
            cancel,
            shutdown,
            timeout,
            ..
        } = self;

        tokio::select! {
            biased;
            outcome = &mut rx => outcome.unwrap_or_else(|_| {
                if shutdown.is_cancelled() {
                    LoadOutcome::Canceled
                } else {
                    LoadOutcome::Failed(Arc::new(Error::Internal(
                        "load dropped without a result".into(),
                    )))
                }
            }),
            _ = cancel.cancelled() => LoadOutcome::Canceled,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                LoadOutcome::Failed(Arc::new(Error::Timeout(timeout)))
            }
        }
    }
}

impl fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("key", &self.key.short())
            .field("timeout", &self.timeout)
            .field("canceled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Blob;
    use crate::request::LoadParams;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn key() -> CacheKey {
        CacheKey::derive("http://host/a", &LoadParams::default()).unwrap()
    }

    fn handle(timeout: Duration) -> (oneshot::Sender<LoadOutcome>, LoadHandle, CancellationToken) {
        let (tx, rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let handle = LoadHandle::new(key(), rx, CancellationToken::new(), shutdown.clone(), timeout);
        (tx, handle, shutdown)
    }

    #[tokio::test]
    async fn test_wait_receives_outcome() {
        let (tx, handle, _) = handle(Duration::from_secs(5));
        tx.send(LoadOutcome::Canceled).unwrap();
        assert_matches!(handle.wait().await, LoadOutcome::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_cancels() {
        let (_tx, handle, _) = handle(Duration::from_secs(5));
        let token = handle.cancel_token();
        let outcome = handle.wait().await;
        assert_matches!(outcome.error(), Some(Error::Timeout(_)));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_sender() {
        let (tx, handle, _) = handle(Duration::from_secs(5));
        drop(tx);
        assert_matches!(handle.wait().await.error(), Some(Error::Internal(_)));

        let (tx, handle, shutdown) = self::handle(Duration::from_secs(5));
        shutdown.cancel();
        drop(tx);
        assert_matches!(handle.wait().await, LoadOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_before_outcome() {
        let (_tx, handle, _) = handle(Duration::from_secs(5));
        handle.cancel();
        assert_matches!(handle.wait().await, LoadOutcome::Canceled);
    }

    #[test]
    fn test_resource_handle_mark_unused() {
        let memory = Arc::new(MemoryTier::new());
        let blob: Arc<dyn Resource> = Arc::new(Blob::new(Bytes::from_static(b"abc")));
        memory.put(key(), blob.clone()).unwrap();

        let handle = ResourceHandle::new(key(), blob, Tier::Network, Arc::downgrade(&memory));
        assert_eq!(handle.tier(), Tier::Network);
        assert!(handle.downcast::<Blob>().is_some());
        assert!(handle.mark_unused());

        drop(memory);
        assert!(!handle.mark_unused());
    }
}
