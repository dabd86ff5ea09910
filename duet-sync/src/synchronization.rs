//! Queued application of inbound operations and the consistency audit.
//!
//! Operations arrive through [`SynchronizationManager::queue_sync`] and are
//! applied in FIFO order once the batch window has passed. A retryable
//! failure puts the entry back at the head and pauses the queue for the
//! retry delay. The periodic audit compares the document with its render
//! tree, repairs drift and escalates to a full rebuild when drift persists.

use std::collections::VecDeque;
use std::time::Duration;

use duet_core::{ElementId, ElementKind, SceneHost};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::applier::finite_points;
use crate::collaboration::{apply_operation, remember_element, target_ids};
use crate::context::{Appliers, ApplyContext, CollaborationContext};
use crate::operation::{ChangeOperation, OperationId, OperationKind};
use crate::scheduler::{TaskId, TimerTask, Timers};
use crate::{SyncConfig, SyncError, SyncResult};

/// An operation waiting in the synchronization queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
    /// Queue-assigned id.
    pub id: OperationId,
    /// The operation to apply.
    pub operation: ChangeOperation,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Scheduler time at which the entry was queued.
    pub enqueued_at: u64,
}

/// Kind of structural drift found by the audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    /// The element has no render handle.
    MissingRenderHandle,
    /// The render handle is not attached to the render tree.
    DisconnectedRenderHandle,
    /// The element has no business object.
    MissingModelObject,
    /// The business object has no id.
    InvalidModelObject,
    /// The declared parent is missing or does not list the element.
    MissingParent,
}

/// One problem found by the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyIssue {
    /// Affected element.
    pub element_id: ElementId,
    /// What is wrong.
    pub kind: IssueKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Snapshot returned by [`SynchronizationManager::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Entries waiting in the queue.
    pub queue_size: usize,
    /// Whether a processing pass is in progress (including its retry wait).
    pub is_processing: bool,
    /// Issues found plus operations dropped, since the session started.
    pub inconsistency_count: u64,
}

/// Counters of the synchronization manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Operations accepted by `queue_sync`.
    pub queued: u64,
    /// Updates merged into a queued entry.
    pub coalesced: u64,
    /// Entries evicted because the queue was full.
    pub evicted: u64,
    /// Entries applied.
    pub applied: u64,
    /// Entries skipped (target missing or deferred).
    pub skipped: u64,
    /// Retry attempts scheduled.
    pub retried: u64,
    /// Entries dropped after exhausting their retries.
    pub dropped: u64,
    /// Entries rejected with a non-retryable error.
    pub rejected: u64,
    /// Edge creations postponed for a missing endpoint.
    pub edge_retries: u64,
    /// Batch members that failed.
    pub batch_failures: u64,
    /// Audits run.
    pub audits: u64,
    /// Issues repaired individually.
    pub repairs: u64,
    /// Full recoveries performed.
    pub recoveries: u64,
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Entries applied.
    pub applied: usize,
    /// Entries skipped.
    pub skipped: usize,
    /// Entries rejected or dropped.
    pub dropped: usize,
    /// Whether the pass stopped on a failure and will resume later.
    pub retry_scheduled: bool,
}

/// What started an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTrigger {
    /// Called directly.
    Manual,
    /// The periodic timer; schedules the next audit.
    Periodic,
    /// The check that follows a full recovery.
    Reaudit,
}

/// Outcome of an audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Issues found.
    pub issues: Vec<ConsistencyIssue>,
    /// Issues repaired individually.
    pub repaired: usize,
    /// Whether the issue budget was exceeded and a full recovery ran.
    pub recovered: bool,
}

type Handler<H> =
    fn(&mut SynchronizationManager, &mut H, &mut Appliers<'_>, &ChangeOperation) -> SyncResult<bool>;

fn handler_for<H: SceneHost>(kind: OperationKind) -> Handler<H> {
    match kind {
        OperationKind::Update => handle_update::<H>,
        OperationKind::Create => handle_create::<H>,
        OperationKind::Remove => handle_remove::<H>,
        OperationKind::ConnectionUpdate => handle_connection_update::<H>,
        OperationKind::Batch => handle_batch::<H>,
    }
}

/// Ordered, retrying application of inbound operations.
#[derive(Debug)]
pub struct SynchronizationManager {
    queue: VecDeque<SyncQueueEntry>,
    capacity: usize,
    max_retries: u32,
    batch_window: Duration,
    retry_delay: Duration,
    edge_retry: Duration,
    remote_ignore: Duration,
    audit_interval: Duration,
    reaudit_delay: Duration,
    issue_budget: usize,
    issues_since_recovery: usize,
    processing: bool,
    process_timer: Option<TaskId>,
    audit_timer: Option<TaskId>,
    reaudit_timer: Option<TaskId>,
    edge_timers: Vec<TaskId>,
    inconsistency_count: u64,
    stats: SyncStats,
}

impl SynchronizationManager {
    /// Create a manager from the session configuration.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: config.queue_capacity,
            max_retries: config.max_retries,
            batch_window: config.batch_window(),
            retry_delay: config.retry_delay(),
            edge_retry: config.edge_retry(),
            remote_ignore: config.remote_ignore(),
            audit_interval: config.audit_interval(),
            reaudit_delay: config.reaudit_delay(),
            issue_budget: config.issue_budget,
            issues_since_recovery: 0,
            processing: false,
            process_timer: None,
            audit_timer: None,
            reaudit_timer: None,
            edge_timers: Vec::new(),
            inconsistency_count: 0,
            stats: SyncStats::default(),
        }
    }

    /// Schedule the periodic audit.
    pub fn start(&mut self, timers: &mut Timers) {
        if self.audit_timer.is_none() {
            self.audit_timer = Some(timers.schedule(self.audit_interval, TimerTask::ConsistencyAudit));
        }
    }

    /// Queue an operation for application after the batch window.
    ///
    /// An update for the same element as the newest untried entry is merged
    /// into it. When the queue is full the oldest entry is evicted.
    pub fn queue_sync(&mut self, operation: ChangeOperation, timers: &mut Timers) -> OperationId {
        self.stats.queued += 1;

        if let Some(back) = self.queue.back_mut() {
            if operation.kind == OperationKind::Update
                && back.operation.kind == OperationKind::Update
                && back.retry_count == 0
                && back.operation.element_id == operation.element_id
            {
                back.operation.changes.merge(operation.changes);
                back.operation.timestamp = back.operation.timestamp.max(operation.timestamp);
                self.stats.coalesced += 1;
                tracing::trace!(element_id = %back.operation.element_id, "queued update coalesced");
                return back.id;
            }
        }

        while self.queue.len() >= self.capacity.max(1) {
            if let Some(evicted) = self.queue.pop_front() {
                self.stats.evicted += 1;
                tracing::warn!(
                    op = %evicted.operation.kind,
                    element_id = %evicted.operation.element_id,
                    capacity = self.capacity,
                    "sync queue full, oldest operation dropped"
                );
            }
        }

        let entry = SyncQueueEntry {
            id: OperationId::new(),
            operation,
            retry_count: 0,
            enqueued_at: timers.now(),
        };
        let id = entry.id;
        self.queue.push_back(entry);

        if self.process_timer.is_none() {
            self.process_timer = Some(timers.schedule(self.batch_window, TimerTask::ProcessQueue));
        }
        id
    }

    /// Drain the queue. Called when the `ProcessQueue` timer fires.
    pub fn process_queue<H: SceneHost>(
        &mut self,
        context: &mut CollaborationContext,
        env: ApplyContext<'_, H>,
    ) -> ProcessReport {
        self.process_timer = None;
        if self.queue.is_empty() {
            self.processing = false;
            return ProcessReport::default();
        }
        self.processing = true;

        let ids = {
            let leaves: Vec<&ChangeOperation> = self
                .queue
                .iter()
                .flat_map(|entry| entry.operation.flatten())
                .collect();
            target_ids(&leaves)
        };
        let remote_ignore = self.remote_ignore;
        let (report, _) = context.apply_remotely(env, ids, remote_ignore, |host, w| self.drain(host, w));

        if report.applied + report.dropped > 0 {
            tracing::debug!(
                applied = report.applied,
                skipped = report.skipped,
                dropped = report.dropped,
                remaining = self.queue.len(),
                "sync queue pass finished"
            );
        }
        report
    }

    fn drain<H: SceneHost>(&mut self, host: &mut H, w: &mut Appliers<'_>) -> ProcessReport {
        let mut report = ProcessReport::default();
        while let Some(mut entry) = self.queue.pop_front() {
            let handler = handler_for::<H>(entry.operation.kind);
            match handler(self, host, w, &entry.operation) {
                Ok(true) => {
                    self.stats.applied += 1;
                    report.applied += 1;
                }
                Ok(false) => {
                    self.stats.skipped += 1;
                    report.skipped += 1;
                }
                Err(e) if e.is_retryable() => {
                    entry.retry_count += 1;
                    if entry.retry_count >= self.max_retries {
                        tracing::warn!(
                            op = %entry.operation.kind,
                            element_id = %entry.operation.element_id,
                            retry = entry.retry_count,
                            error = %e,
                            "sync operation dropped after retries"
                        );
                        self.stats.dropped += 1;
                        self.inconsistency_count += 1;
                        report.dropped += 1;
                        continue;
                    }
                    tracing::debug!(
                        op = %entry.operation.kind,
                        element_id = %entry.operation.element_id,
                        retry = entry.retry_count,
                        error = %e,
                        "sync operation failed, retrying"
                    );
                    self.stats.retried += 1;
                    self.queue.push_front(entry);
                    self.process_timer = Some(w.timers.schedule(self.retry_delay, TimerTask::ProcessQueue));
                    report.retry_scheduled = true;
                    return report;
                }
                Err(e) => {
                    tracing::warn!(
                        op = %entry.operation.kind,
                        element_id = %entry.operation.element_id,
                        error = %e,
                        "sync operation rejected"
                    );
                    self.stats.rejected += 1;
                    self.inconsistency_count += 1;
                    report.dropped += 1;
                }
            }
        }
        self.processing = false;
        report
    }

    /// Second attempt at an edge creation postponed for a missing endpoint.
    ///
    /// Returns whether the edge now exists. A failure is final.
    pub fn retry_edge_create<H: SceneHost>(
        &mut self,
        context: &mut CollaborationContext,
        env: ApplyContext<'_, H>,
        task: TaskId,
        operation: &ChangeOperation,
    ) -> bool {
        self.edge_timers.retain(|t| *t != task);
        let id = &operation.element_id;
        let (result, _) = context.apply_remotely(env, vec![id.clone()], self.remote_ignore, |host, w| {
            w.applier.create_element(host, id, &operation.changes)?;
            remember_element(host, w.tracker, id);
            Ok::<(), SyncError>(())
        });
        match result {
            Ok(()) => {
                tracing::debug!(element_id = %id, "postponed edge created");
                true
            }
            Err(e) => {
                tracing::warn!(element_id = %id, error = %e, "edge creation abandoned");
                self.stats.dropped += 1;
                self.inconsistency_count += 1;
                false
            }
        }
    }

    /// Check the document against its render tree without changing anything.
    #[must_use]
    pub fn validate_sync<H: SceneHost + ?Sized>(&self, host: &H) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();
        for id in host.element_ids() {
            let Some(element) = host.get_element(&id) else { continue };
            if element.is_root() {
                continue;
            }
            match host.render_handle(&id) {
                None => issues.push(issue(&id, IssueKind::MissingRenderHandle, "no render handle")),
                Some(handle) if !handle.attached => issues.push(issue(
                    &id,
                    IssueKind::DisconnectedRenderHandle,
                    "render handle not attached",
                )),
                Some(_) => {}
            }
            match &element.business_object {
                None => issues.push(issue(&id, IssueKind::MissingModelObject, "no business object")),
                Some(bo) if bo.id.is_empty() => {
                    issues.push(issue(&id, IssueKind::InvalidModelObject, "business object has no id"));
                }
                Some(_) => {}
            }
            // Only a declared parent is checked.
            if let Some(parent) = &element.parent {
                match host.get_element(parent) {
                    None => issues.push(issue(
                        &id,
                        IssueKind::MissingParent,
                        &format!("parent {parent} not found"),
                    )),
                    Some(p) if !p.children.contains(&id) => issues.push(issue(
                        &id,
                        IssueKind::MissingParent,
                        &format!("parent {parent} does not list the element"),
                    )),
                    Some(_) => {}
                }
            }
        }
        issues
    }

    /// Audit the document and repair what is found.
    ///
    /// Issues count against the budget; once it is exceeded every render
    /// handle is rebuilt and a re-audit is scheduled.
    pub fn run_audit<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        timers: &mut Timers,
        trigger: AuditTrigger,
    ) -> AuditReport {
        match trigger {
            AuditTrigger::Periodic => {
                self.audit_timer = Some(timers.schedule(self.audit_interval, TimerTask::ConsistencyAudit));
            }
            AuditTrigger::Reaudit => self.reaudit_timer = None,
            AuditTrigger::Manual => {}
        }
        self.stats.audits += 1;

        let issues = self.validate_sync(host);
        let mut report = AuditReport::default();
        if issues.is_empty() {
            return report;
        }
        self.inconsistency_count += issues.len() as u64;
        self.issues_since_recovery += issues.len();
        tracing::warn!(
            issues = issues.len(),
            budget_used = self.issues_since_recovery,
            "consistency audit found drift"
        );

        if self.issues_since_recovery > self.issue_budget {
            self.full_recovery(host, timers);
            report.recovered = true;
        } else {
            for found in &issues {
                match repair(host, found) {
                    Ok(()) => report.repaired += 1,
                    Err(e) => {
                        tracing::warn!(element_id = %found.element_id, kind = ?found.kind, error = %e, "repair failed");
                    }
                }
            }
            self.stats.repairs += report.repaired as u64;
        }
        report.issues = issues;
        report
    }

    fn full_recovery<H: SceneHost + ?Sized>(&mut self, host: &mut H, timers: &mut Timers) {
        tracing::warn!(budget = self.issue_budget, "issue budget exceeded, rebuilding render tree");
        host.suspend_rendering();
        let root = host.root_id().clone();
        for id in host.element_ids() {
            if id == root {
                continue;
            }
            host.remove_render_handle(&id);
            if let Err(e) = host.create_render_handle(&id) {
                tracing::warn!(element_id = %id, error = %e, "render handle rebuild failed");
                continue;
            }
            let parent = host
                .get_element(&id)
                .and_then(|e| e.parent.clone())
                .filter(|p| host.get_element(p).is_some())
                .unwrap_or_else(|| root.clone());
            if let Err(e) = host.attach_element(&id, &parent) {
                tracing::warn!(element_id = %id, error = %e, "render handle reattach failed");
            }
        }
        host.force_redraw();
        host.resume_rendering();

        self.issues_since_recovery = 0;
        self.stats.recoveries += 1;
        if let Some(task) = self.reaudit_timer.take() {
            timers.cancel(task);
        }
        self.reaudit_timer = Some(timers.schedule(self.reaudit_delay, TimerTask::RecoveryReaudit));
    }

    /// Queue size, processing state and inconsistency count.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            queue_size: self.queue.len(),
            is_processing: self.processing,
            inconsistency_count: self.inconsistency_count,
        }
    }

    /// Entries waiting in the queue, head first.
    #[must_use]
    pub fn queued(&self) -> &VecDeque<SyncQueueEntry> {
        &self.queue
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Cancel every timer and empty the queue.
    pub fn destroy(&mut self, timers: &mut Timers) {
        let owned = [self.process_timer.take(), self.audit_timer.take(), self.reaudit_timer.take()];
        for task in owned.into_iter().flatten().chain(self.edge_timers.drain(..)) {
            timers.cancel(task);
        }
        self.queue.clear();
        self.processing = false;
    }
}

fn issue(element_id: &ElementId, kind: IssueKind, detail: &str) -> ConsistencyIssue {
    ConsistencyIssue {
        element_id: element_id.clone(),
        kind,
        detail: detail.to_string(),
    }
}

/// Fix one issue without touching element render updates.
fn repair<H: SceneHost + ?Sized>(host: &mut H, found: &ConsistencyIssue) -> SyncResult<()> {
    let id = &found.element_id;
    let Some(element) = host.get_element(id) else {
        return Err(SyncError::ElementNotFound(id.to_string()));
    };
    let kind = element.kind;
    let parent = element
        .parent
        .clone()
        .filter(|p| host.get_element(p).is_some())
        .unwrap_or_else(|| host.root_id().clone());

    match found.kind {
        IssueKind::MissingRenderHandle => {
            host.create_render_handle(id)?;
            host.attach_element(id, &parent)?;
        }
        IssueKind::DisconnectedRenderHandle | IssueKind::MissingParent => {
            host.attach_element(id, &parent)?;
        }
        IssueKind::MissingModelObject => {
            let mut attrs = Map::new();
            attrs.insert("id".into(), Value::String(id.to_string()));
            let business_object = host.create_model_object(kind.default_type_tag(), attrs);
            if let Some(element) = host.get_element_mut(id) {
                element.business_object = Some(business_object);
            }
        }
        IssueKind::InvalidModelObject => {
            if let Some(bo) = host.get_element_mut(id).and_then(|e| e.business_object.as_mut()) {
                bo.id = id.to_string();
            }
        }
    }
    tracing::debug!(element_id = %id, kind = ?found.kind, "consistency issue repaired");
    Ok(())
}

fn handle_update<H: SceneHost>(
    _: &mut SynchronizationManager,
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    apply_operation(host, w, op)
}

fn handle_remove<H: SceneHost>(
    _: &mut SynchronizationManager,
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    apply_operation(host, w, op)
}

fn handle_create<H: SceneHost>(
    manager: &mut SynchronizationManager,
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    let id = &op.element_id;
    if host.get_element(id).is_none() {
        if let Some(spec) = op.changes.element.as_ref().filter(|s| s.kind == ElementKind::Connection) {
            let missing = [&spec.source, &spec.target]
                .into_iter()
                .flatten()
                .find(|endpoint| host.get_element(endpoint).is_none());
            if let Some(endpoint) = missing {
                tracing::debug!(element_id = %id, endpoint = %endpoint, "edge endpoint missing, retrying later");
                let task = w
                    .timers
                    .schedule(manager.edge_retry, TimerTask::RetryEdgeCreate(op.clone()));
                manager.edge_timers.push(task);
                manager.stats.edge_retries += 1;
                return Ok(false);
            }
        }
    }
    apply_operation(host, w, op)
}

fn handle_connection_update<H: SceneHost>(
    _: &mut SynchronizationManager,
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    let id = &op.element_id;
    let Some(points) = &op.changes.waypoints else {
        return Err(SyncError::InvalidPayload(format!("connection update for {id} has no waypoints")));
    };
    let points = finite_points(points);
    if points.is_empty() {
        return Err(SyncError::InvalidPayload(format!(
            "connection update for {id} has no finite waypoints"
        )));
    }
    let mut filtered = op.clone();
    filtered.changes.waypoints = Some(points);
    apply_operation(host, w, &filtered)
}

fn handle_batch<H: SceneHost>(
    manager: &mut SynchronizationManager,
    host: &mut H,
    w: &mut Appliers<'_>,
    op: &ChangeOperation,
) -> SyncResult<bool> {
    let mut applied = 0usize;
    let mut failed = 0u64;
    host.suspend_rendering();
    for leaf in op.flatten() {
        let handler = handler_for::<H>(leaf.kind);
        match handler(manager, host, w, leaf) {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(op = %leaf.kind, element_id = %leaf.element_id, error = %e, "batch member failed");
                failed += 1;
            }
        }
    }
    host.force_redraw();
    host.resume_rendering();

    if failed > 0 {
        manager.stats.batch_failures += failed;
        manager.inconsistency_count += failed;
    }
    Ok(applied > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::SilentMutationApplier;
    use crate::operation::{ChangePayload, ElementSpec, VisualChange};
    use crate::suppression::EventSuppressionManager;
    use crate::tracker::ChangeTracker;
    use duet_core::{Bounds, Element, MemoryHost, Point};

    struct Fixture {
        host: MemoryHost,
        context: CollaborationContext,
        tracker: ChangeTracker,
        applier: SilentMutationApplier,
        suppression: EventSuppressionManager,
        timers: Timers,
        sync: SynchronizationManager,
    }

    impl Fixture {
        fn with_config(config: &SyncConfig) -> Self {
            let mut host = MemoryHost::new();
            host.seed(Element::shape("Task_1", Bounds::new(100.0, 100.0, 100.0, 80.0)))
                .expect("seed");
            host.seed(Element::shape("Task_2", Bounds::new(400.0, 100.0, 100.0, 80.0)))
                .expect("seed");
            host.seed(Element::connection(
                "Flow_1",
                "Task_1".into(),
                "Task_2".into(),
                vec![Point::new(200.0, 140.0), Point::new(400.0, 140.0)],
            ))
            .expect("seed");
            Self {
                host,
                context: CollaborationContext::new(),
                tracker: ChangeTracker::new(config),
                applier: SilentMutationApplier::new(),
                suppression: EventSuppressionManager::new(),
                timers: Timers::new(),
                sync: SynchronizationManager::new(config),
            }
        }

        fn new() -> Self {
            Self::with_config(&SyncConfig::default())
        }

        fn advance(&mut self, until: u64) {
            while let Some((task_id, task)) = self.timers.pop_due(until) {
                let env = ApplyContext {
                    host: &mut self.host,
                    tracker: &mut self.tracker,
                    applier: &mut self.applier,
                    suppression: &mut self.suppression,
                    timers: &mut self.timers,
                };
                match task {
                    TimerTask::ProcessQueue => {
                        self.sync.process_queue(&mut self.context, env);
                    }
                    TimerTask::RetryEdgeCreate(op) => {
                        self.sync.retry_edge_create(&mut self.context, env, task_id, &op);
                    }
                    TimerTask::ConsistencyAudit => {
                        self.sync
                            .run_audit(&mut self.host, &mut self.timers, AuditTrigger::Periodic);
                    }
                    TimerTask::RecoveryReaudit => {
                        self.sync
                            .run_audit(&mut self.host, &mut self.timers, AuditTrigger::Reaudit);
                    }
                    _ => {}
                }
                self.host.flush_deferred();
                self.host.events_mut().clear_inbox();
            }
        }

        fn x_of(&self, id: &str) -> f64 {
            self.host.get_element(&id.into()).expect("element").bounds.x
        }
    }

    fn move_to(id: &str, x: f64) -> ChangeOperation {
        ChangeOperation::update(id, ChangePayload::visual(VisualChange::position(x, 100.0)))
    }

    #[test]
    fn test_updates_to_same_element_coalesce() {
        let mut f = Fixture::new();
        f.sync.queue_sync(move_to("Task_1", 150.0), &mut f.timers);
        f.sync.queue_sync(move_to("Task_1", 175.0), &mut f.timers);
        f.sync.queue_sync(move_to("Task_1", 300.0), &mut f.timers);
        assert_eq!(f.sync.status().queue_size, 1);
        assert_eq!(f.sync.stats().coalesced, 2);

        f.host.reset_render_stats();
        f.advance(50);
        assert_eq!(f.x_of("Task_1"), 300.0);
        assert_eq!(f.host.render_stats().handle_updates, 1);
        assert_eq!(f.sync.status(), SyncStatus::default());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut f = Fixture::new();
        for i in 0..150 {
            f.sync.queue_sync(move_to(&format!("Shape_{i}"), 1.0), &mut f.timers);
        }
        assert_eq!(f.sync.status().queue_size, 100);
        assert_eq!(f.sync.stats().evicted, 50);
        assert_eq!(
            f.sync.queued().front().map(|e| e.operation.element_id.clone()),
            Some("Shape_50".into())
        );
    }

    #[test]
    fn test_transient_failure_retries_then_succeeds() {
        let mut f = Fixture::new();
        f.host.fail_next_render_updates(1);
        f.sync.queue_sync(move_to("Task_1", 300.0), &mut f.timers);

        f.advance(50);
        assert_eq!(f.sync.queued().front().map(|e| e.retry_count), Some(1));
        assert!(f.sync.status().is_processing);

        f.advance(100);
        assert_eq!(f.sync.status().queue_size, 0);
        assert!(!f.sync.status().is_processing);
        assert_eq!(f.x_of("Task_1"), 300.0);
    }

    #[test]
    fn test_entry_dropped_after_three_failures() {
        let mut f = Fixture::new();
        f.host.fail_next_render_updates(10);
        f.sync.queue_sync(move_to("Task_1", 300.0), &mut f.timers);
        f.advance(1_000);

        let stats = f.sync.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(f.sync.status().inconsistency_count, 1);
        assert_eq!(f.sync.status().queue_size, 0);
    }

    #[test]
    fn test_edge_waits_once_for_missing_endpoint() {
        let mut f = Fixture::new();
        let edge = ChangeOperation::create(
            "Flow_2",
            ChangePayload {
                element: Some(ElementSpec {
                    kind: ElementKind::Connection,
                    type_tag: None,
                    parent: None,
                    source: Some("Task_2".into()),
                    target: Some("Task_3".into()),
                }),
                ..ChangePayload::default()
            },
        );
        let task = ChangeOperation::create(
            "Task_3",
            ChangePayload {
                element: Some(ElementSpec {
                    kind: ElementKind::Shape,
                    type_tag: None,
                    parent: None,
                    source: None,
                    target: None,
                }),
                ..ChangePayload::visual(VisualChange::from_bounds(Bounds::new(700.0, 100.0, 100.0, 80.0)))
            },
        );
        f.sync.queue_sync(edge, &mut f.timers);
        f.advance(50);
        assert!(f.host.get_element(&"Flow_2".into()).is_none());
        assert_eq!(f.sync.stats().edge_retries, 1);

        f.sync.queue_sync(task, &mut f.timers);
        f.advance(300);
        assert!(f.host.get_element(&"Flow_2".into()).is_some());
    }

    #[test]
    fn test_connection_update_without_finite_points_is_rejected() {
        let mut f = Fixture::new();
        f.sync.queue_sync(
            ChangeOperation::connection_update("Flow_1", vec![Point::new(f64::NAN, 1.0)]),
            &mut f.timers,
        );
        f.advance(50);
        assert_eq!(f.sync.stats().rejected, 1);
        let flow = f.host.get_element(&"Flow_1".into()).expect("flow");
        assert_eq!(flow.waypoints[0], Point::new(200.0, 140.0));
    }

    #[test]
    fn test_batch_redraws_once_and_keeps_partial_results() {
        let mut f = Fixture::new();
        f.host.reset_render_stats();
        let batch = ChangeOperation::batch(vec![
            move_to("Task_1", 10.0),
            ChangeOperation::connection_update("Flow_1", vec![]),
            move_to("Task_2", 20.0),
        ]);
        f.sync.queue_sync(batch, &mut f.timers);
        f.advance(50);

        assert_eq!(f.x_of("Task_1"), 10.0);
        assert_eq!(f.x_of("Task_2"), 20.0);
        assert_eq!(f.sync.stats().batch_failures, 1);
        assert_eq!(f.host.render_stats().redraws, 1);
    }

    #[test]
    fn test_audit_repairs_drift() {
        let mut f = Fixture::new();
        f.host.drop_render_handle(&"Task_1".into());
        f.host.disconnect_render_handle(&"Task_2".into());
        if let Some(flow) = f.host.get_element_mut(&"Flow_1".into()) {
            flow.business_object = None;
        }

        let report = f.sync.run_audit(&mut f.host, &mut f.timers, AuditTrigger::Manual);
        assert_eq!(report.issues.len(), 3);
        assert_eq!(report.repaired, 3);
        assert!(!report.recovered);
        assert!(f.sync.validate_sync(&f.host).is_empty());
        assert_eq!(f.sync.status().inconsistency_count, 3);
    }

    #[test]
    fn test_undeclared_parent_is_not_an_issue() {
        let mut f = Fixture::new();
        if let Some(task) = f.host.get_element_mut(&"Task_1".into()) {
            task.parent = None;
        }
        assert!(f.sync.validate_sync(&f.host).is_empty());

        if let Some(task) = f.host.get_element_mut(&"Task_1".into()) {
            task.parent = Some("Lane_9".into());
        }
        let issues = f.sync.validate_sync(&f.host);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::MissingParent);
    }

    #[test]
    fn test_budget_exceeded_triggers_full_recovery() {
        let config = SyncConfig {
            issue_budget: 2,
            ..SyncConfig::default()
        };
        let mut f = Fixture::with_config(&config);
        for id in ["Task_1", "Task_2", "Flow_1"] {
            f.host.disconnect_render_handle(&id.into());
        }
        f.host.reset_render_stats();

        let report = f.sync.run_audit(&mut f.host, &mut f.timers, AuditTrigger::Manual);
        assert!(report.recovered);
        assert_eq!(f.host.render_stats().redraws, 1);
        assert_eq!(f.sync.stats().recoveries, 1);
        assert!(f.sync.validate_sync(&f.host).is_empty());

        f.advance(1_000);
        assert_eq!(f.sync.stats().audits, 2);
    }

    #[test]
    fn test_periodic_audit_reschedules_itself() {
        let mut f = Fixture::new();
        f.sync.start(&mut f.timers);
        f.advance(15_000);
        assert_eq!(f.sync.stats().audits, 3);
    }

    #[test]
    fn test_destroy_cancels_timers() {
        let mut f = Fixture::new();
        f.sync.start(&mut f.timers);
        f.sync.queue_sync(move_to("Task_1", 300.0), &mut f.timers);
        f.sync.destroy(&mut f.timers);
        assert!(f.timers.is_empty());
        f.advance(10_000);
        assert_eq!(f.x_of("Task_1"), 100.0);
    }
}
