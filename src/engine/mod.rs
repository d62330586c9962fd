//! Task scheduling engines
//!
//! Three dispatchers, one per tier, hand tasks to each other through the
//! [`Router`]. Transition decisions live in [`next_tier`] only.

mod dispatcher;
mod router;
mod task;
mod workers;

pub use dispatcher::{Dispatcher, TierWorker};
pub use router::Router;
pub use task::{next_tier, Task, TaskState, Tier, TierOutcome, Transition};
pub use workers::{DiskWorker, MemoryWorker};

pub(crate) use workers::cache_in_memory;
