//! The per-document collaboration session.
//!
//! [`CollabSession`] owns the host, the scheduler and every component, and
//! lends them out to one another for the duration of a call. It is the
//! single entry point for the transport layer and the host application.

use std::time::Duration;

use duet_core::{ElementId, SceneHost};
use serde::{Deserialize, Serialize};

use crate::applier::{ApplierStats, SilentMutationApplier};
use crate::collaboration::{remember_element, CollaborationEventStats, CollaborationManager, RemoteApplyReport};
use crate::context::{ApplyContext, CollaborationContext};
use crate::history::{Command, CommandHistoryManager, UndoRedoStatus};
use crate::operation::{parse_wire, ChangeOperation, ChangePayload, OperationId};
use crate::scheduler::{TaskId, TimerTask, Timers};
use crate::suppression::{EventSuppressionManager, SuppressionStats};
use crate::synchronization::{
    AuditReport, AuditTrigger, ConsistencyIssue, SyncStats, SyncStatus, SynchronizationManager,
};
use crate::tracker::{ChangeTracker, TrackerStats};
use crate::{SyncConfig, SyncResult};

/// Lend the session's parts to a component as an [`ApplyContext`].
macro_rules! apply_env {
    ($session:expr) => {
        ApplyContext {
            host: &mut $session.host,
            tracker: &mut $session.tracker,
            applier: &mut $session.applier,
            suppression: &mut $session.suppression,
            timers: &mut $session.timers,
        }
    };
}

/// Inbound message from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum WireMessage {
    /// Remote operations to apply right away.
    Apply(Vec<ChangeOperation>),
    /// Remote operations to apply through the sync queue.
    Queue(Vec<ChangeOperation>),
    /// Wire JSON holding one operation or an array, applied right away.
    Text(String),
}

/// Aggregated counters of every component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Scheduler time (ms).
    pub now: u64,
    /// Change tracker.
    pub tracker: TrackerStats,
    /// Silent applier.
    pub applier: ApplierStats,
    /// Event suppression.
    pub suppression: SuppressionStats,
    /// Collaboration manager.
    pub collaboration: CollaborationEventStats,
    /// Synchronization manager.
    pub sync: SyncStats,
    /// User history.
    pub history: UndoRedoStatus,
}

/// A collaboration session over one document.
pub struct CollabSession<H: SceneHost> {
    host: H,
    config: SyncConfig,
    context: CollaborationContext,
    timers: Timers,
    tracker: ChangeTracker,
    applier: SilentMutationApplier,
    suppression: EventSuppressionManager,
    history: CommandHistoryManager<H>,
    collaboration: CollaborationManager,
    sync: SynchronizationManager,
    started: bool,
    destroyed: bool,
}

impl<H: SceneHost> std::fmt::Debug for CollabSession<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("now", &self.timers.now())
            .field("status", &self.sync.status())
            .field("outbound", &self.context.outbound_len())
            .field("started", &self.started)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl<H: SceneHost> CollabSession<H> {
    /// Create a session over `host`.
    #[must_use]
    pub fn new(host: H, config: SyncConfig) -> Self {
        Self {
            tracker: ChangeTracker::new(&config),
            collaboration: CollaborationManager::new(&config),
            sync: SynchronizationManager::new(&config),
            host,
            config,
            context: CollaborationContext::new(),
            timers: Timers::new(),
            applier: SilentMutationApplier::new(),
            suppression: EventSuppressionManager::new(),
            history: CommandHistoryManager::new(),
            started: false,
            destroyed: false,
        }
    }

    /// Start the periodic consistency audit.
    pub fn start(&mut self) {
        if self.started || self.destroyed {
            return;
        }
        self.started = true;
        self.sync.start(&mut self.timers);
        tracing::info!(audit_interval_ms = self.config.audit_interval_ms, "collaboration session started");
    }

    /// Deliver pending host events to local change detection.
    ///
    /// Returns the number of events looked at.
    pub fn pump(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.host.flush_deferred();
        let events = self.host.events_mut().drain_inbox();
        for event in &events {
            self.collaboration.handle_host_event(
                &self.host,
                &mut self.context,
                &mut self.tracker,
                &mut self.timers,
                event,
            );
        }
        events.len()
    }

    /// Advance virtual time by `delta`, firing every timer that comes due.
    pub fn advance_by(&mut self, delta: Duration) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let until = self.timers.now() + delta.as_millis() as u64;
        self.advance_to(until)
    }

    /// Advance virtual time to `until` (ms), firing timers in due order.
    ///
    /// Host events are pumped before the first timer and after each one.
    /// Returns the number of timers fired.
    pub fn advance_to(&mut self, until: u64) -> usize {
        if self.destroyed {
            return 0;
        }
        self.pump();
        let mut fired = 0;
        while let Some((task_id, task)) = self.timers.pop_due(until) {
            self.dispatch(task_id, task);
            self.pump();
            fired += 1;
        }
        self.host.set_now(self.timers.now());
        fired
    }

    fn dispatch(&mut self, task_id: TaskId, task: TimerTask) {
        self.host.set_now(self.timers.now());
        tracing::trace!(task = ?task, now = self.timers.now(), "timer fired");
        match task {
            TimerTask::ExpireIgnore(id) => self.tracker.expire_ignore(&id),
            TimerTask::ClearPending(id) => self.tracker.clear_pending(&id),
            TimerTask::FlushChanges => {
                self.collaboration
                    .flush_changes(&mut self.context, &mut self.tracker, &mut self.timers);
            }
            TimerTask::ReleaseRemoteMarkers(ids) => {
                let now = self.timers.now();
                self.context.release_markers(task_id, &ids, now);
            }
            TimerTask::ProcessQueue => {
                self.sync.process_queue(&mut self.context, apply_env!(self));
            }
            TimerTask::RetryEdgeCreate(op) => {
                self.sync
                    .retry_edge_create(&mut self.context, apply_env!(self), task_id, &op);
            }
            TimerTask::ConsistencyAudit => {
                self.sync
                    .run_audit(&mut self.host, &mut self.timers, AuditTrigger::Periodic);
            }
            TimerTask::RecoveryReaudit => {
                self.sync
                    .run_audit(&mut self.host, &mut self.timers, AuditTrigger::Reaudit);
            }
        }
    }

    /// Queue a remote operation for ordered, retrying application.
    ///
    /// Returns `None` once the session is destroyed.
    pub fn queue_sync(&mut self, operation: ChangeOperation) -> Option<OperationId> {
        if self.destroyed {
            return None;
        }
        Some(self.sync.queue_sync(operation, &mut self.timers))
    }

    /// Apply remote operations now.
    ///
    /// Local events still pending are handled first so they are not mistaken
    /// for echoes. Leaves that failed for a reason worth retrying are handed
    /// to the sync queue.
    pub fn apply_remote_changes(&mut self, operations: &[ChangeOperation]) -> RemoteApplyReport {
        if self.destroyed {
            return RemoteApplyReport::default();
        }
        self.pump();
        let report = self
            .collaboration
            .apply_remote_changes(&mut self.context, apply_env!(self), operations);
        for op in &report.deferred {
            self.sync.queue_sync(op.clone(), &mut self.timers);
        }
        report
    }

    /// Ask the tracker whether a change is new; see [`ChangeTracker::should_process_change`].
    pub fn should_process_change(&mut self, element_id: &ElementId, payload: &ChangePayload) -> bool {
        self.tracker
            .should_process_change(element_id, payload, &mut self.timers)
    }

    /// Reject every change to `element_id` for `duration`.
    pub fn add_to_temporary_ignore(&mut self, element_id: &ElementId, duration: Duration) {
        self.tracker
            .add_to_temporary_ignore(element_id, duration, &mut self.timers);
    }

    /// Handle a transport message.
    ///
    /// # Errors
    ///
    /// Returns an error if a text message is not valid wire JSON.
    pub fn receive(&mut self, message: WireMessage) -> SyncResult<RemoteApplyReport> {
        match message {
            WireMessage::Apply(operations) => Ok(self.apply_remote_changes(&operations)),
            WireMessage::Queue(operations) => {
                for op in operations {
                    self.queue_sync(op);
                }
                Ok(RemoteApplyReport::default())
            }
            WireMessage::Text(json) => {
                let operations = parse_wire(&json)?;
                Ok(self.apply_remote_changes(&operations))
            }
        }
    }

    /// Take every local operation waiting for broadcast.
    pub fn take_outbound(&mut self) -> Vec<ChangeOperation> {
        self.context.take_outbound()
    }

    /// Execute a user command; it becomes undoable and is broadcast.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn execute_local(&mut self, command: Box<dyn Command<H>>) -> SyncResult<()> {
        self.history.execute_as_user(command, &mut self.host)?;
        self.pump();
        Ok(())
    }

    /// Execute a command on behalf of a collaborator.
    ///
    /// Nothing is recorded and nothing it causes is broadcast.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn execute_collaborative(&mut self, command: Box<dyn Command<H>>) -> SyncResult<()> {
        self.pump();
        let (result, touched) = {
            let _remote = self.context.begin_remote(&[]);
            let result = self.history.execute_as_collaboration(command, &mut self.host);
            self.host.flush_deferred();
            let mut touched: Vec<ElementId> = Vec::new();
            for event in self.host.events_mut().drain_inbox() {
                if let Some(id) = event.element_id {
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                }
            }
            (result, touched)
        };
        for id in &touched {
            remember_element(&self.host, &mut self.tracker, id);
        }
        result
    }

    /// Undo the last user command. Returns false when there is none.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn undo(&mut self) -> SyncResult<bool> {
        let undone = self.history.undo(&mut self.host)?;
        self.pump();
        Ok(undone)
    }

    /// Redo the last undone user command. Returns false when there is none.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn redo(&mut self) -> SyncResult<bool> {
        let redone = self.history.redo(&mut self.host)?;
        self.pump();
        Ok(redone)
    }

    /// Queue size, processing state and inconsistency count.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.sync.status()
    }

    /// Check the document against its render tree without repairing it.
    #[must_use]
    pub fn validate_sync(&self) -> Vec<ConsistencyIssue> {
        self.sync.validate_sync(&self.host)
    }

    /// Run an audit now, repairing what it finds.
    pub fn audit(&mut self) -> AuditReport {
        self.sync
            .run_audit(&mut self.host, &mut self.timers, AuditTrigger::Manual)
    }

    /// Counters of every component.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            now: self.timers.now(),
            tracker: self.tracker.stats(),
            applier: self.applier.stats(),
            suppression: self.suppression.stats(),
            collaboration: self.collaboration.stats(),
            sync: self.sync.stats(),
            history: self.history.undo_redo_status(),
        }
    }

    /// Scheduler time (ms).
    #[must_use]
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// Due time of the next timer, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.timers.next_due()
    }

    /// The scene graph host.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The scene graph host, mutably. Call [`Self::pump`] after editing.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// The collaboration state.
    #[must_use]
    pub fn context(&self) -> &CollaborationContext {
        &self.context
    }

    /// The change tracker.
    #[must_use]
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// The command histories.
    #[must_use]
    pub fn history(&self) -> &CommandHistoryManager<H> {
        &self.history
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether [`Self::destroy`] was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Cancel every timer and drop all queued work.
    ///
    /// No timer fires afterwards and every entry point becomes a no-op.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.tracker.destroy(&mut self.timers);
        self.collaboration.destroy(&mut self.context, &mut self.timers);
        self.sync.destroy(&mut self.timers);
        self.suppression.destroy(&mut self.host);
        self.history.clear();
        self.timers.clear();
        self.host.events_mut().clear_inbox();
        self.destroyed = true;
        tracing::info!("collaboration session destroyed");
    }
}
