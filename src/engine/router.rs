//! Task router
//!
//! Every task leaving a dispatcher comes back through one channel. The loader
//! owns the receiving end: terminal tasks are delivered to their caller, the
//! rest are submitted to the dispatcher of their new tier.

use tokio::sync::mpsc;
use tracing::trace;

use super::task::Task;

#[derive(Clone)]
pub struct Router {
    tx: mpsc::UnboundedSender<Task>,
}

impl Router {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a task back to the routing loop
    ///
    /// After shutdown the task is dropped, which resolves its caller.
    pub fn route(&self, task: Task) {
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            trace!(task = task.id(), "Router closed, dropping task");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
