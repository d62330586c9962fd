//! Task state machine
//!
//! A [`Task`] is one caller's load. Tier workers report a [`TierOutcome`];
//! [`next_tier`] alone decides where the task goes next, so no tier encodes
//! routing rules of its own.
//!
//! ```text
//!            Miss              Miss (http)
//!  Memory ─────────► Disk ───────────────► Network
//!    │                ▲                       │
//!    │                └──── Redirect ─────────┤ (history hit, bounce += 1)
//!    │ Hit                 Hit │              │ Hit / Failed / Canceled
//!    ▼                         ▼              ▼
//!  ─────────────── terminal: delivered to the caller ────────────────
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheKey;
use crate::decode::Resource;
use crate::error::Error;
use crate::loader::LoadOutcome;
use crate::request::{LoadRequest, SourceType};

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Memory,
    Disk,
    Network,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Disk => write!(f, "disk"),
            Tier::Network => write!(f, "network"),
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    StandBy,
    Running,
    Succeed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeed | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// What a tier worker found
#[derive(Clone)]
pub enum TierOutcome {
    Hit(Arc<dyn Resource>),
    Miss,
    /// Send the task back to disk (network tier history hit)
    Redirect,
    Failed(Arc<Error>),
    Canceled,
}

impl fmt::Debug for TierOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierOutcome::Hit(r) => write!(f, "Hit({} bytes)", r.byte_size()),
            TierOutcome::Miss => write!(f, "Miss"),
            TierOutcome::Redirect => write!(f, "Redirect"),
            TierOutcome::Failed(e) => write!(f, "Failed({})", e),
            TierOutcome::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Where a task goes after an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enqueue(Tier),
    Finish(TaskState),
}

/// Central transition function
pub fn next_tier(task: &Task, outcome: &TierOutcome) -> Transition {
    match (outcome, task.tier) {
        (TierOutcome::Hit(_), _) => Transition::Finish(TaskState::Succeed),
        (TierOutcome::Failed(_), _) => Transition::Finish(TaskState::Failed),
        (TierOutcome::Canceled, _) => Transition::Finish(TaskState::Canceled),
        (TierOutcome::Miss, Tier::Memory) => Transition::Enqueue(Tier::Disk),
        (TierOutcome::Miss, Tier::Disk) => match task.request.params.source {
            SourceType::Http => Transition::Enqueue(Tier::Network),
            SourceType::LocalFile => Transition::Finish(TaskState::Failed),
        },
        (TierOutcome::Redirect, Tier::Network) => Transition::Enqueue(Tier::Disk),
        (TierOutcome::Miss | TierOutcome::Redirect, _) => Transition::Finish(TaskState::Failed),
    }
}

/// One caller's load
pub struct Task {
    pub(crate) id: u64,
    pub(crate) key: CacheKey,
    pub(crate) request: LoadRequest,
    pub(crate) tier: Tier,
    pub(crate) state: TaskState,
    /// Times the network tier sent this task back to disk
    pub(crate) network_bounces: u32,
    pub(crate) cancel: CancellationToken,
    pub(crate) resource: Option<Arc<dyn Resource>>,
    /// Tier that produced the resource
    pub(crate) served_by: Option<Tier>,
    pub(crate) error: Option<Arc<Error>>,
    pub(crate) responder: Option<oneshot::Sender<LoadOutcome>>,
    pub(crate) created: Instant,
}

impl Task {
    pub fn new(
        id: u64,
        key: CacheKey,
        request: LoadRequest,
        responder: oneshot::Sender<LoadOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            key,
            request,
            tier: Tier::Memory,
            state: TaskState::StandBy,
            network_bounces: 0,
            cancel,
            resource: None,
            served_by: None,
            error: None,
            responder: Some(responder),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_indispensable(&self) -> bool {
        self.request.params.indispensable
    }

    /// Mark the task as picked up by a tier worker
    pub fn start(&mut self) {
        self.state = TaskState::Running;
    }

    /// Apply a tier outcome through [`next_tier`]
    pub fn apply(&mut self, outcome: TierOutcome) -> Transition {
        let transition = next_tier(self, &outcome);
        match transition {
            Transition::Enqueue(tier) => {
                if matches!(outcome, TierOutcome::Redirect) {
                    self.network_bounces += 1;
                }
                self.tier = tier;
                self.state = TaskState::StandBy;
            }
            Transition::Finish(state) => {
                self.state = state;
                match outcome {
                    TierOutcome::Hit(resource) => {
                        self.resource = Some(resource);
                        self.served_by = Some(self.tier);
                    }
                    TierOutcome::Failed(error) => self.error = Some(error),
                    TierOutcome::Miss | TierOutcome::Redirect => {
                        self.error = Some(Arc::new(Error::NotFound(
                            self.request.resource_id.clone(),
                        )));
                    }
                    TierOutcome::Canceled => {}
                }
            }
        }
        transition
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("key", &self.key.short())
            .field("tier", &self.tier)
            .field("state", &self.state)
            .field("bounces", &self.network_bounces)
            .field("age", &self.created.elapsed())
            .finish()
    }
}
