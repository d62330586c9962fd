//! Bounded-concurrency tier dispatcher
//!
//! One dispatcher per tier. `submit` queues a task and `ignite` starts as
//! many queued tasks as the ceiling allows. Every finished task releases its
//! slot and ignites again, so the pump sustains itself without polling.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, trace};

use super::router::Router;
use super::task::{Task, Tier, TierOutcome};

/// Work performed for a task at one tier
#[async_trait]
pub trait TierWorker: Send + Sync + 'static {
    fn tier(&self) -> Tier;

    /// Run `task` at this tier and return it with the outcome applied.
    /// Returns `None` when the worker keeps ownership of the task, e.g. a
    /// network task parked in a fetch group.
    async fn execute(&self, task: Task) -> Option<Task>;
}

struct DispatcherInner {
    worker: Arc<dyn TierWorker>,
    max_running: usize,
    running: AtomicUsize,
    queue: Mutex<VecDeque<Task>>,
    router: Router,
    runtime: Handle,
}

/// Tier dispatcher handle
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        worker: Arc<dyn TierWorker>,
        max_running: usize,
        router: Router,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                worker,
                max_running: max_running.max(1),
                running: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
                router,
                runtime,
            }),
        }
    }

    pub fn tier(&self) -> Tier {
        self.inner.worker.tier()
    }

    /// Queue a task and pump
    pub fn submit(&self, task: Task) {
        trace!(tier = %self.tier(), task = task.id(), "Task queued");
        self.inner.queue.lock().push_back(task);
        self.ignite();
    }

    /// Start queued tasks up to the concurrency ceiling
    pub fn ignite(&self) {
        DispatcherInner::ignite(&self.inner);
    }

    /// Tasks currently executing
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Tasks waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn max_running(&self) -> usize {
        self.inner.max_running
    }
}

impl DispatcherInner {
    fn ignite(this: &Arc<Self>) {
        let batch: Vec<Task> = {
            let mut queue = this.queue.lock();
            let mut batch = Vec::new();
            while this.running.load(Ordering::Acquire) < this.max_running {
                let Some(task) = queue.pop_front() else {
                    break;
                };
                this.running.fetch_add(1, Ordering::AcqRel);
                batch.push(task);
            }
            batch
        };

        for task in batch {
            let inner = this.clone();
            this.runtime.spawn(async move {
                inner.run(task).await;
                inner.running.fetch_sub(1, Ordering::AcqRel);
                DispatcherInner::ignite(&inner);
            });
        }
    }

    async fn run(&self, mut task: Task) {
        let tier = self.worker.tier();
        let id = task.id();

        if task.is_canceled() {
            debug!(%tier, task = id, "Task canceled before execution");
            task.apply(TierOutcome::Canceled);
            self.router.route(task);
            return;
        }

        // a panic drops the task and with it the caller's responder
        let result = AssertUnwindSafe(self.worker.execute(task))
            .catch_unwind()
            .await;
        match result {
            Ok(Some(task)) => self.router.route(task),
            Ok(None) => {}
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%tier, task = id, panic = %message, "Tier worker panicked");
            }
        }
    }
}
