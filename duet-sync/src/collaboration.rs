//! Local event handling and inbound remote application.
//!
//! ## Loop prevention
//!
//! ```text
//!  remote op ──► flag set ──► markers set ──► silent apply ──► flag cleared
//!                                                  │
//!                            deferred host events ─┘─► consume marker ─► dropped
//!
//!  local edit ──► host event ──► not ignored ──► tracker batch ──► outbound op
//! ```
//!
//! Three independent layers keep remote changes from being rebroadcast: the
//! `is_processing_remote_event` flag, silent mode on the event bus and the
//! one-shot per-element markers that outlive the application by the remote
//! ignore window. The tracker's equality check is the last line: after a
//! remote application the tracker remembers the new state, so an echo that
//! slips through compares equal and is dropped.

use std::time::Duration;

use duet_core::{ElementId, EventSource, EventType, HostEvent, SceneHost};
use serde::{Deserialize, Serialize};

use crate::context::{Appliers, ApplyContext, CollaborationContext};
use crate::operation::{ChangeOperation, ChangePayload, OperationKind, Origin};
use crate::scheduler::Timers;
use crate::tracker::ChangeTracker;
use crate::{SyncConfig, SyncError, SyncResult};

/// Counters of the collaboration manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationEventStats {
    /// Host events that reached local change detection.
    pub handled: u64,
    /// Host events dropped as self-caused or remote.
    pub ignored: u64,
    /// Operations queued for broadcast.
    pub broadcast: u64,
    /// Remote leaf operations applied.
    pub remote_applied: u64,
    /// Remote leaf operations that failed.
    pub remote_failed: u64,
}

/// Outcome of [`CollaborationManager::apply_remote_changes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteApplyReport {
    /// Leaf operations applied.
    pub applied: usize,
    /// Leaf operations skipped (missing element).
    pub skipped: usize,
    /// Leaf operations that failed.
    pub failed: usize,
    /// Failed leaves worth another attempt through the sync queue: retryable
    /// errors and creates whose parent or endpoint has not arrived yet.
    pub deferred: Vec<ChangeOperation>,
}

/// Orchestrates local change detection and remote application.
#[derive(Debug)]
pub struct CollaborationManager {
    remote_ignore: Duration,
    stats: CollaborationEventStats,
}

impl CollaborationManager {
    /// Create a manager from the session configuration.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            remote_ignore: config.remote_ignore(),
            stats: CollaborationEventStats::default(),
        }
    }

    /// Whether a host event must not reach local change detection.
    ///
    /// Events are dropped while a remote application is in progress, when
    /// their source tag is `silentUpdate` or `collaboration`, and when their
    /// element carries a remote marker (which the event consumes).
    pub fn should_ignore_event(&mut self, context: &mut CollaborationContext, event: &HostEvent) -> bool {
        if context.is_processing_remote_event() {
            return true;
        }
        if matches!(
            event.source,
            Some(EventSource::SilentUpdate | EventSource::Collaboration)
        ) {
            return true;
        }
        match &event.element_id {
            Some(id) => context.consume_marker(id),
            None => false,
        }
    }

    /// Feed one host event into local change detection.
    pub fn handle_host_event<H: SceneHost + ?Sized>(
        &mut self,
        host: &H,
        context: &mut CollaborationContext,
        tracker: &mut ChangeTracker,
        timers: &mut Timers,
        event: &HostEvent,
    ) {
        if !event.event_type.is_change() {
            return;
        }
        if self.should_ignore_event(context, event) {
            self.stats.ignored += 1;
            tracing::trace!(event = %event.event_type, element_id = ?event.element_id, "host event ignored");
            return;
        }
        self.stats.handled += 1;

        match event.event_type {
            EventType::ShapeAdded | EventType::ConnectionAdded => {
                let Some(id) = &event.element_id else { return };
                if self.is_ignored(tracker, timers, id) {
                    return;
                }
                let Some(element) = host.get_element(id) else {
                    tracing::debug!(element_id = %id, "added element vanished before broadcast");
                    return;
                };
                let mut changes = ChangePayload::for_create(element);
                if let Some(spec) = changes.element.as_mut() {
                    if spec.parent.as_ref() == Some(host.root_id()) {
                        spec.parent = None;
                    }
                }
                tracker.remember(id, &ChangePayload::from_element(element));
                self.broadcast(
                    context,
                    ChangeOperation::new(OperationKind::Create, id.clone(), changes, Origin::Local),
                );
            }
            EventType::ShapeRemoved | EventType::ConnectionRemoved => {
                let Some(id) = &event.element_id else { return };
                if self.is_ignored(tracker, timers, id) {
                    return;
                }
                tracker.reset(id, timers);
                self.broadcast(
                    context,
                    ChangeOperation::new(
                        OperationKind::Remove,
                        id.clone(),
                        ChangePayload::default(),
                        Origin::Local,
                    ),
                );
            }
            EventType::ElementsChanged => {
                let ids: Vec<ElementId> = event
                    .payload
                    .get("elements")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                for id in ids {
                    Self::queue_local_change(host, tracker, timers, &id);
                }
            }
            _ => {
                if let Some(id) = &event.element_id {
                    Self::queue_local_change(host, tracker, timers, id);
                }
            }
        }
    }

    fn is_ignored(&mut self, tracker: &ChangeTracker, timers: &Timers, id: &ElementId) -> bool {
        if tracker.is_ignored(id, timers.now()) {
            self.stats.ignored += 1;
            tracing::trace!(element_id = %id, "structural change to ignored element not broadcast");
            return true;
        }
        false
    }

    fn queue_local_change<H: SceneHost + ?Sized>(
        host: &H,
        tracker: &mut ChangeTracker,
        timers: &mut Timers,
        id: &ElementId,
    ) {
        if let Some(element) = host.get_element(id) {
            if !element.is_root() {
                tracker.queue_change(id, ChangePayload::from_element(element), timers);
            }
        }
    }

    /// Flush the tracker's debounced batch into outbound operations.
    ///
    /// Returns the number of operations queued for broadcast.
    pub fn flush_changes(
        &mut self,
        context: &mut CollaborationContext,
        tracker: &mut ChangeTracker,
        timers: &mut Timers,
    ) -> usize {
        let admitted = tracker.process_batch(timers);
        let count = admitted.len();
        for (id, changes) in admitted {
            let kind = if changes.waypoints.is_some() && changes.visual.is_none() {
                OperationKind::ConnectionUpdate
            } else {
                OperationKind::Update
            };
            tracker.complete(&id, timers);
            self.broadcast(
                context,
                ChangeOperation::new(kind, id, changes, Origin::Local),
            );
        }
        count
    }

    fn broadcast(&mut self, context: &mut CollaborationContext, operation: ChangeOperation) {
        tracing::debug!(
            op = %operation.kind,
            element_id = %operation.element_id,
            "local change queued for broadcast"
        );
        context.push_outbound(operation);
        self.stats.broadcast += 1;
    }

    /// Apply remote operations silently. Batches are flattened.
    ///
    /// Every target element is marked for the remote ignore window. Errors
    /// are logged and counted; none escapes.
    pub fn apply_remote_changes<H: SceneHost + ?Sized>(
        &mut self,
        context: &mut CollaborationContext,
        env: ApplyContext<'_, H>,
        operations: &[ChangeOperation],
    ) -> RemoteApplyReport {
        let leaves: Vec<&ChangeOperation> = operations.iter().flat_map(|op| op.flatten()).collect();
        let ids = target_ids(&leaves);

        let (report, discarded) = context.apply_remotely(env, ids, self.remote_ignore, |host, w| {
            let mut report = RemoteApplyReport::default();
            for op in &leaves {
                match apply_operation(host, w, op) {
                    Ok(true) => report.applied += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(
                            op = %op.kind,
                            element_id = %op.element_id,
                            error = %e,
                            "remote operation failed"
                        );
                        report.failed += 1;
                        let missing_dependency = op.kind == OperationKind::Create
                            && matches!(e, SyncError::ElementNotFound(_));
                        if e.is_retryable() || missing_dependency {
                            report.deferred.push((*op).clone());
                        }
                    }
                }
            }
            report
        });

        self.stats.ignored += discarded as u64;
        self.stats.remote_applied += report.applied as u64;
        self.stats.remote_failed += report.failed as u64;
        report
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CollaborationEventStats {
        self.stats
    }

    /// Cancel pending marker releases and drop the collaboration state.
    pub fn destroy(&mut self, context: &mut CollaborationContext, timers: &mut Timers) {
        context.destroy(timers);
    }
}

/// Distinct non-empty element ids of `operations`, in first-seen order.
pub(crate) fn target_ids(operations: &[&ChangeOperation]) -> Vec<ElementId> {
    let mut ids: Vec<ElementId> = Vec::new();
    for op in operations {
        if !op.element_id.is_empty() && !ids.contains(&op.element_id) {
            ids.push(op.element_id.clone());
        }
    }
    ids
}

/// Apply one non-batch operation and update tracked state.
///
/// Returns `Ok(false)` when the operation was skipped.
pub(crate) fn apply_operation<H: SceneHost + ?Sized>(
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    let id = &op.element_id;
    let applier = &mut *w.applier;
    let applied = match op.kind {
        OperationKind::Create => {
            applier.create_element(host, id, &op.changes)?;
            true
        }
        OperationKind::Update => applier.apply_changes(host, id, &op.changes)?,
        OperationKind::ConnectionUpdate => {
            if op.changes.waypoints.is_none() {
                return Err(SyncError::InvalidPayload(format!(
                    "connection update for {id} has no waypoints"
                )));
            }
            applier.apply_changes(host, id, &op.changes)?
        }
        OperationKind::Remove => {
            let removed = applier.remove_element(host, id)?;
            for element in &removed {
                w.tracker.reset(element, w.timers);
            }
            return Ok(!removed.is_empty());
        }
        OperationKind::Batch => {
            return Err(SyncError::InvalidPayload("nested batch not flattened".into()));
        }
    };
    if applied {
        remember_element(host, w.tracker, id);
    }
    Ok(applied)
}

/// Record an element's current state in the tracker.
///
/// A local change still waiting in the debounce batch describes state the
/// remote write has replaced, so it is dropped.
pub(crate) fn remember_element<H: SceneHost + ?Sized>(
    host: &H,
    tracker: &mut ChangeTracker,
    id: &ElementId,
) {
    if tracker.discard_queued(id) {
        tracing::trace!(element_id = %id, "batched local change superseded by remote state");
    }
    if let Some(element) = host.get_element(id) {
        tracker.remember(id, &ChangePayload::from_element(element));
    }
}
