//! Cancellable timer scheduler.
//!
//! Every delayed action in the session (debounce flushes, ignore expiry,
//! retries, audits) is a [`TimerTask`] entry here. Time is virtual: the owner
//! moves it forward with [`Scheduler::pop_due`], which makes cancellation and
//! tests deterministic.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use duet_core::ElementId;

use crate::ChangeOperation;

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Delayed actions owned by the session components.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerTask {
    /// Drop an element from the tracker's ignore set.
    ExpireIgnore(ElementId),
    /// Release the tracker's re-entrancy guard for an element.
    ClearPending(ElementId),
    /// Flush the tracker's debounced change batch.
    FlushChanges,
    /// Drop the one-shot ignore markers installed by a remote application.
    ReleaseRemoteMarkers(Vec<ElementId>),
    /// Drain the synchronization queue.
    ProcessQueue,
    /// Second and last attempt at creating an edge whose endpoint was missing.
    RetryEdgeCreate(ChangeOperation),
    /// Periodic consistency audit.
    ConsistencyAudit,
    /// Audit that follows a full recovery.
    RecoveryReaudit,
}

/// Ordered set of timers keyed by due time.
#[derive(Debug)]
pub struct Scheduler<T> {
    now: u64,
    next_id: u64,
    queue: BTreeMap<(u64, TaskId), T>,
    due_by_id: HashMap<TaskId, u64>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    /// Create an empty scheduler at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: 0,
            next_id: 0,
            queue: BTreeMap::new(),
            due_by_id: HashMap::new(),
        }
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Schedule a task `delay` after the current time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn schedule(&mut self, delay: Duration, task: T) -> TaskId {
        let due = self.now.saturating_add(delay.as_millis() as u64);
        self.schedule_at(due, task)
    }

    /// Schedule a task at an absolute time. Past times fire on the next pop.
    pub fn schedule_at(&mut self, due: u64, task: T) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.queue.insert((due, id), task);
        self.due_by_id.insert(id, due);
        id
    }

    /// Cancel a task. Returns it if it had not fired yet.
    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let due = self.due_by_id.remove(&id)?;
        self.queue.remove(&(due, id))
    }

    /// Whether a task is still waiting to fire.
    #[must_use]
    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.due_by_id.contains_key(&id)
    }

    /// Due time of the earliest task.
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Pop the earliest task due at or before `until`, moving the clock to its due time.
    ///
    /// Tasks with equal due times fire in scheduling order. Returns `None`
    /// (and moves the clock to `until`) once nothing else is due.
    pub fn pop_due(&mut self, until: u64) -> Option<(TaskId, T)> {
        let Some(&key) = self.queue.keys().next() else {
            self.now = self.now.max(until);
            return None;
        };
        if key.0 > until {
            self.now = self.now.max(until);
            return None;
        }
        let task = self.queue.remove(&key)?;
        self.due_by_id.remove(&key.1);
        self.now = self.now.max(key.0);
        Some((key.1, task))
    }

    /// Move the clock forward without firing anything.
    pub fn set_now(&mut self, now: u64) {
        self.now = self.now.max(now);
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no task is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.due_by_id.clear();
    }
}

/// The scheduler type shared by the session components.
pub type Timers = Scheduler<TimerTask>;
