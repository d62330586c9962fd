//! Fetch groups
//!
//! At most one physical fetch per cache key. The first task to reach the
//! network for a key becomes the group leader and runs the fetch; later tasks
//! join the group and are parked until [`GroupRegistry::complete`] hands all
//! members back with the shared outcome.
//!
//! A member's cancellation only withdraws that member. The fetch itself is
//! canceled once every member has withdrawn.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CacheKey;
use crate::engine::Task;

struct TaskGroup {
    id: u64,
    members: Vec<Task>,
    /// Sticky: raised when any member is indispensable
    indispensable: Arc<AtomicBool>,
    fetch_cancel: CancellationToken,
    /// Fires when the group completes; stops member watchers
    done: CancellationToken,
}

/// What the leader needs to run the fetch
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub group_id: u64,
    pub cancel: CancellationToken,
    pub indispensable: Arc<AtomicBool>,
}

impl FetchTicket {
    pub fn is_indispensable(&self) -> bool {
        self.indispensable.load(Ordering::Acquire)
    }
}

/// Result of joining
#[derive(Debug)]
pub enum Join {
    /// First task for the key: run the fetch
    Leader(FetchTicket),
    /// Parked behind an in-flight fetch
    Member,
}

/// In-flight fetches by cache key
pub struct GroupRegistry {
    groups: Arc<DashMap<CacheKey, TaskGroup>>,
    next_id: AtomicU64,
    /// Parent of every fetch token
    shutdown: CancellationToken,
}

impl GroupRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Add `task` to the group for its key, creating the group if none is in
    /// flight
    pub fn join(&self, task: Task) -> Join {
        let key = task.key().clone();
        let indispensable = task.is_indispensable();
        let cancel = task.cancel.clone();

        let (join, group_id, done) = match self.groups.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let group = slot.get_mut();
                if indispensable && !group.indispensable.swap(true, Ordering::AcqRel) {
                    debug!(key = %key.short(), group = group.id, "Fetch escalated to indispensable");
                }
                group.members.push(task);
                (Join::Member, group.id, group.done.clone())
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let group = TaskGroup {
                    id,
                    members: vec![task],
                    indispensable: Arc::new(AtomicBool::new(indispensable)),
                    fetch_cancel: self.shutdown.child_token(),
                    done: CancellationToken::new(),
                };
                let ticket = FetchTicket {
                    group_id: id,
                    cancel: group.fetch_cancel.clone(),
                    indispensable: group.indispensable.clone(),
                };
                let done = group.done.clone();
                slot.insert(group);
                (Join::Leader(ticket), id, done)
            }
        };

        self.watch_member(key, group_id, cancel, done);
        join
    }

    /// Cancel the fetch once every member of the group has withdrawn
    fn watch_member(
        &self,
        key: CacheKey,
        group_id: u64,
        cancel: CancellationToken,
        done: CancellationToken,
    ) {
        let groups = self.groups.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = cancel.cancelled() => {}
            }
            if let Some(group) = groups.get(&key) {
                if group.id == group_id && group.members.iter().all(Task::is_canceled) {
                    debug!(key = %key.short(), group = group_id, "Every member canceled, stopping fetch");
                    group.fetch_cancel.cancel();
                }
            }
        });
    }

    /// Remove the group for `key` and return its members
    pub fn complete(&self, key: &CacheKey) -> Vec<Task> {
        match self.groups.remove(key) {
            Some((_, group)) => {
                group.done.cancel();
                group.members
            }
            None => Vec::new(),
        }
    }

    /// Members parked behind the fetch for `key`
    pub fn members(&self, key: &CacheKey) -> usize {
        self.groups.get(key).map_or(0, |group| group.members.len())
    }

    /// Fetches currently running
    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
