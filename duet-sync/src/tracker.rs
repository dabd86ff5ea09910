//! Change tracking: deduplication, significance and the ignore set.
//!
//! The tracker remembers the last processed state of every element as a JSON
//! snapshot (structural back-references stripped) and decides whether an
//! observed change is new. Elements in the temporary ignore set and elements
//! with an application already pending are never admitted.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use duet_core::ElementId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::{ChangePayload, VisualChange};
use crate::scheduler::{TaskId, TimerTask, Timers};
use crate::SyncConfig;

/// Business attributes whose change is always significant.
pub const BUSINESS_KEYS: &[&str] = &["name", "id", "$type", "conditionExpression", "documentation"];

/// Classification of an admitted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeCategory {
    /// An allowlisted business attribute changed.
    BusinessObject,
    /// Geometry moved or resized beyond the threshold.
    Visual,
    /// Anything else (waypoints, element descriptor).
    Other,
}

/// One entry of the bounded change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Changed element.
    pub element_id: ElementId,
    /// Classification.
    pub category: ChangeCategory,
    /// Virtual time of admission (ms).
    pub timestamp: u64,
}

/// Tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    /// Elements with a tracked state.
    pub tracked: usize,
    /// Elements currently in the ignore set.
    pub ignored: usize,
    /// Elements with a pending application.
    pub pending: usize,
    /// Changes admitted.
    pub admitted: u64,
    /// Changes rejected as duplicates.
    pub duplicates: u64,
    /// Changes rejected because the element was ignored.
    pub ignored_rejections: u64,
    /// Changes rejected by the re-entrancy guard.
    pub pending_rejections: u64,
    /// Batched changes dropped as insignificant.
    pub insignificant: u64,
}

struct IgnoreEntry {
    expires_at: u64,
    timer: TaskId,
}

/// Per-element change tracker.
pub struct ChangeTracker {
    visual_threshold: f64,
    history_limit: usize,
    pending_clear: Duration,
    batch_window: Duration,
    tracked: HashMap<ElementId, Value>,
    ignored: HashMap<ElementId, IgnoreEntry>,
    pending: HashMap<ElementId, TaskId>,
    batch: Vec<(ElementId, ChangePayload)>,
    batch_timer: Option<TaskId>,
    history: VecDeque<ChangeRecord>,
    stats: TrackerStats,
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("tracked", &self.tracked.len())
            .field("ignored", &self.ignored.len())
            .field("pending", &self.pending.len())
            .field("batch", &self.batch.len())
            .finish()
    }
}

impl ChangeTracker {
    /// Create a tracker from the session configuration.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            visual_threshold: config.visual_threshold,
            history_limit: config.history_limit,
            pending_clear: config.pending_clear(),
            batch_window: config.batch_window(),
            tracked: HashMap::new(),
            ignored: HashMap::new(),
            pending: HashMap::new(),
            batch: Vec::new(),
            batch_timer: None,
            history: VecDeque::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Decide whether a change is new, and admit it if so.
    ///
    /// Rejects ignored elements, elements with a pending application and
    /// payloads equal to the tracked state. An admitted change updates the
    /// tracked state, marks the element pending (self-clearing) and is
    /// appended to the history.
    pub fn should_process_change(
        &mut self,
        element_id: &ElementId,
        payload: &ChangePayload,
        timers: &mut Timers,
    ) -> bool {
        if self.is_ignored(element_id, timers.now()) {
            tracing::trace!(element_id = %element_id, "change rejected: element ignored");
            self.stats.ignored_rejections += 1;
            return false;
        }
        if self.pending.contains_key(element_id) {
            tracing::trace!(element_id = %element_id, "change rejected: application pending");
            self.stats.pending_rejections += 1;
            return false;
        }
        let snapshot = match payload.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(element_id = %element_id, error = %e, "cannot snapshot change payload");
                return false;
            }
        };
        let previous = self.tracked.get(element_id);
        if previous == Some(&snapshot) {
            self.stats.duplicates += 1;
            return false;
        }

        let category = self.classify(previous, &snapshot);
        self.tracked.insert(element_id.clone(), snapshot);
        let timer = timers.schedule(
            self.pending_clear,
            TimerTask::ClearPending(element_id.clone()),
        );
        self.pending.insert(element_id.clone(), timer);
        self.record(ChangeRecord {
            element_id: element_id.clone(),
            category,
            timestamp: timers.now(),
        });
        self.stats.admitted += 1;
        true
    }

    /// Whether a change differs from the tracked state by more than noise.
    ///
    /// Significant means: geometry moved by more than the threshold, an
    /// allowlisted business attribute changed, or the route or element
    /// descriptor changed. Untracked elements are always significant.
    #[must_use]
    pub fn is_significant(&self, element_id: &ElementId, payload: &ChangePayload) -> bool {
        let Some(previous) = self.tracked.get(element_id) else {
            return true;
        };
        let Ok(snapshot) = payload.snapshot() else {
            return false;
        };
        let structural = ["waypoints", "element"]
            .iter()
            .any(|key| snapshot.get(*key).is_some() && previous.get(*key) != snapshot.get(*key));
        if structural || business_changed(previous, &snapshot) {
            return true;
        }
        match (visual_of(previous), visual_of(&snapshot)) {
            (Some(old), Some(new)) => new.differs_from(&old, self.visual_threshold),
            (None, Some(_)) => true,
            _ => false,
        }
    }

    fn classify(&self, previous: Option<&Value>, snapshot: &Value) -> ChangeCategory {
        let Some(previous) = previous else {
            return if snapshot.get("businessObject").is_some() {
                ChangeCategory::BusinessObject
            } else if snapshot.get("visual").is_some() {
                ChangeCategory::Visual
            } else {
                ChangeCategory::Other
            };
        };

        if business_changed(previous, snapshot) {
            return ChangeCategory::BusinessObject;
        }
        match (visual_of(previous), visual_of(snapshot)) {
            (Some(old), Some(new)) if new.differs_from(&old, self.visual_threshold) => {
                ChangeCategory::Visual
            }
            (None, Some(_)) => ChangeCategory::Visual,
            _ => ChangeCategory::Other,
        }
    }

    fn record(&mut self, record: ChangeRecord) {
        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Ignore every change to `element_id` for `duration`.
    ///
    /// Re-adding an ignored element restarts its expiry.
    pub fn add_to_temporary_ignore(
        &mut self,
        element_id: &ElementId,
        duration: Duration,
        timers: &mut Timers,
    ) {
        if let Some(previous) = self.ignored.remove(element_id) {
            timers.cancel(previous.timer);
        }
        let timer = timers.schedule(duration, TimerTask::ExpireIgnore(element_id.clone()));
        #[allow(clippy::cast_possible_truncation)]
        let expires_at = timers.now().saturating_add(duration.as_millis() as u64);
        self.ignored
            .insert(element_id.clone(), IgnoreEntry { expires_at, timer });
    }

    /// Whether `element_id` is in the ignore set at time `now`.
    #[must_use]
    pub fn is_ignored(&self, element_id: &ElementId, now: u64) -> bool {
        self.ignored
            .get(element_id)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Drop an ignore entry whose timer fired.
    pub fn expire_ignore(&mut self, element_id: &ElementId) {
        if self.ignored.remove(element_id).is_some() {
            tracing::trace!(element_id = %element_id, "ignore entry expired");
        }
    }

    /// Release the re-entrancy guard whose timer fired.
    pub fn clear_pending(&mut self, element_id: &ElementId) {
        self.pending.remove(element_id);
    }

    /// Release the re-entrancy guard once the caller finished with the change.
    pub fn complete(&mut self, element_id: &ElementId, timers: &mut Timers) {
        if let Some(timer) = self.pending.remove(element_id) {
            timers.cancel(timer);
        }
    }

    /// Whether an application for `element_id` is pending.
    #[must_use]
    pub fn is_pending(&self, element_id: &ElementId) -> bool {
        self.pending.contains_key(element_id)
    }

    /// Record state without admitting it, so later identical changes compare equal.
    pub fn remember(&mut self, element_id: &ElementId, payload: &ChangePayload) {
        match payload.snapshot() {
            Ok(snapshot) => {
                self.tracked.insert(element_id.clone(), snapshot);
            }
            Err(e) => {
                tracing::warn!(element_id = %element_id, error = %e, "cannot snapshot remembered state");
            }
        }
    }

    /// Tracked snapshot of an element.
    #[must_use]
    pub fn tracked_state(&self, element_id: &ElementId) -> Option<&Value> {
        self.tracked.get(element_id)
    }

    /// Forget everything known about an element (tracked state, guard, ignore entry).
    pub fn reset(&mut self, element_id: &ElementId, timers: &mut Timers) {
        self.tracked.remove(element_id);
        self.complete(element_id, timers);
        if let Some(entry) = self.ignored.remove(element_id) {
            timers.cancel(entry.timer);
        }
        self.batch.retain(|(id, _)| id != element_id);
    }

    /// Add a change to the debounced batch.
    ///
    /// Changes to the same element merge, later values winning. Every call
    /// restarts the debounce window.
    pub fn queue_change(
        &mut self,
        element_id: &ElementId,
        payload: ChangePayload,
        timers: &mut Timers,
    ) {
        match self.batch.iter_mut().find(|(id, _)| id == element_id) {
            Some((_, existing)) => existing.merge(payload),
            None => self.batch.push((element_id.clone(), payload)),
        }
        if let Some(timer) = self.batch_timer.take() {
            timers.cancel(timer);
        }
        self.batch_timer = Some(timers.schedule(self.batch_window, TimerTask::FlushChanges));
    }

    /// Drop the batched change of an element, if any.
    pub fn discard_queued(&mut self, element_id: &ElementId) -> bool {
        let before = self.batch.len();
        self.batch.retain(|(id, _)| id != element_id);
        self.batch.len() != before
    }

    /// Number of elements in the debounced batch.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Flush the debounced batch. Returns the admitted changes in first-seen order.
    pub fn process_batch(&mut self, timers: &mut Timers) -> Vec<(ElementId, ChangePayload)> {
        if let Some(timer) = self.batch_timer.take() {
            timers.cancel(timer);
        }
        let batch = std::mem::take(&mut self.batch);
        let mut admitted = Vec::with_capacity(batch.len());
        for (element_id, payload) in batch {
            if !self.is_significant(&element_id, &payload) {
                self.stats.insignificant += 1;
                continue;
            }
            if self.should_process_change(&element_id, &payload, timers) {
                admitted.push((element_id, payload));
            }
        }
        admitted
    }

    /// The bounded change history, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<ChangeRecord> {
        &self.history
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            tracked: self.tracked.len(),
            ignored: self.ignored.len(),
            pending: self.pending.len(),
            ..self.stats
        }
    }

    /// Cancel every timer and drop all state.
    pub fn destroy(&mut self, timers: &mut Timers) {
        for (_, timer) in self.pending.drain() {
            timers.cancel(timer);
        }
        for (_, entry) in self.ignored.drain() {
            timers.cancel(entry.timer);
        }
        if let Some(timer) = self.batch_timer.take() {
            timers.cancel(timer);
        }
        self.tracked.clear();
        self.batch.clear();
        self.history.clear();
    }
}

fn visual_of(snapshot: &Value) -> Option<VisualChange> {
    snapshot
        .get("visual")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn business_changed(previous: &Value, snapshot: &Value) -> bool {
    snapshot.get("businessObject").is_some()
        && BUSINESS_KEYS.iter().any(|key| {
            let pointer = format!("/businessObject/{key}");
            previous.pointer(&pointer) != snapshot.pointer(&pointer)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::Point;
    use serde_json::json;

    fn tracker() -> (ChangeTracker, Timers) {
        (ChangeTracker::new(&SyncConfig::default()), Timers::new())
    }

    fn at(x: f64, y: f64) -> ChangePayload {
        ChangePayload::visual(VisualChange::position(x, y))
    }

    fn named(name: &str) -> ChangePayload {
        ChangePayload::attributes(json!({ "name": name }).as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_same_payload_is_admitted_once() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        assert!(tracker.should_process_change(&id, &at(10.0, 10.0), &mut timers));
        tracker.complete(&id, &mut timers);
        assert!(!tracker.should_process_change(&id, &at(10.0, 10.0), &mut timers));
        assert_eq!(tracker.stats().duplicates, 1);
    }

    #[test]
    fn test_pending_guard_self_clears() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        assert!(tracker.should_process_change(&id, &at(10.0, 10.0), &mut timers));
        assert!(!tracker.should_process_change(&id, &at(20.0, 20.0), &mut timers));

        while let Some((_, task)) = timers.pop_due(1_000) {
            if let TimerTask::ClearPending(element) = task {
                tracker.clear_pending(&element);
            }
        }
        assert!(tracker.should_process_change(&id, &at(20.0, 20.0), &mut timers));
    }

    #[test]
    fn test_ignored_element_is_rejected_until_expiry() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        tracker.add_to_temporary_ignore(&id, Duration::from_millis(100), &mut timers);
        assert!(!tracker.should_process_change(&id, &at(1.0, 1.0), &mut timers));

        let (_, task) = timers.pop_due(100).expect("expiry timer");
        assert_eq!(task, TimerTask::ExpireIgnore(id.clone()));
        tracker.expire_ignore(&id);
        assert!(tracker.should_process_change(&id, &at(1.0, 1.0), &mut timers));
    }

    #[test]
    fn test_readding_ignore_restarts_expiry() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        tracker.add_to_temporary_ignore(&id, Duration::from_millis(100), &mut timers);
        timers.set_now(80);
        tracker.add_to_temporary_ignore(&id, Duration::from_millis(100), &mut timers);
        assert_eq!(timers.len(), 1);
        assert!(tracker.is_ignored(&id, 150));
        assert!(!tracker.is_ignored(&id, 180));
    }

    #[test]
    fn test_classification() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        tracker.remember(&id, &at(10.0, 10.0));
        assert!(tracker.should_process_change(&id, &at(30.0, 10.0), &mut timers));
        tracker.complete(&id, &mut timers);
        assert!(tracker.should_process_change(&id, &named("Review"), &mut timers));

        let categories: Vec<_> = tracker.history().iter().map(|r| r.category).collect();
        assert_eq!(
            categories,
            vec![ChangeCategory::Visual, ChangeCategory::BusinessObject]
        );
    }

    #[test]
    fn test_subthreshold_jitter_is_insignificant() {
        let (mut tracker, _) = tracker();
        let id = ElementId::from("Task_1");
        tracker.remember(&id, &at(10.0, 10.0));
        assert!(!tracker.is_significant(&id, &at(10.5, 9.8)));
        assert!(tracker.is_significant(&id, &at(12.0, 10.0)));
        assert!(tracker.is_significant(&ElementId::from("Other"), &at(0.0, 0.0)));
    }

    #[test]
    fn test_custom_attribute_alone_is_insignificant() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        let with = |attrs: Value| {
            ChangePayload::attributes(attrs.as_object().cloned().unwrap_or_default())
        };
        tracker.remember(&id, &with(json!({ "name": "Review", "color": "red" })));

        let recolored = with(json!({ "name": "Review", "color": "blue" }));
        assert!(!tracker.is_significant(&id, &recolored));
        tracker.queue_change(&id, recolored, &mut timers);
        assert!(tracker.process_batch(&mut timers).is_empty());
        assert_eq!(tracker.stats().insignificant, 1);

        let renamed = with(json!({ "name": "Approve", "color": "blue" }));
        assert!(tracker.is_significant(&id, &renamed));
    }

    #[test]
    fn test_route_change_is_significant() {
        let (mut tracker, _) = tracker();
        let id = ElementId::from("Flow_1");
        tracker.remember(&id, &ChangePayload::waypoints(vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)]));
        assert!(tracker.is_significant(
            &id,
            &ChangePayload::waypoints(vec![Point::new(0.0, 0.0), Point::new(10.0, 5.0)])
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut tracker, mut timers) = tracker();
        for i in 0..60 {
            let id = ElementId::new(format!("Task_{i}"));
            assert!(tracker.should_process_change(&id, &at(f64::from(i), 0.0), &mut timers));
        }
        assert_eq!(tracker.history().len(), 50);
        assert_eq!(tracker.history()[0].element_id.as_str(), "Task_10");
    }

    #[test]
    fn test_batch_collapses_to_latest_change() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        tracker.queue_change(&id, at(10.0, 10.0), &mut timers);
        timers.set_now(30);
        tracker.queue_change(&id, at(40.0, 40.0), &mut timers);
        assert_eq!(tracker.batch_len(), 1);
        assert_eq!(timers.next_due(), Some(80));

        let admitted = tracker.process_batch(&mut timers);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].1, at(40.0, 40.0));
        assert_eq!(tracker.batch_len(), 0);
    }

    #[test]
    fn test_reset_forgets_state() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        assert!(tracker.should_process_change(&id, &at(1.0, 1.0), &mut timers));
        tracker.reset(&id, &mut timers);
        assert!(tracker.tracked_state(&id).is_none());
        assert!(tracker.should_process_change(&id, &at(1.0, 1.0), &mut timers));
    }

    #[test]
    fn test_destroy_cancels_timers() {
        let (mut tracker, mut timers) = tracker();
        let id = ElementId::from("Task_1");
        tracker.add_to_temporary_ignore(&id, Duration::from_millis(100), &mut timers);
        tracker.queue_change(&ElementId::from("Task_2"), at(1.0, 1.0), &mut timers);
        assert!(tracker.should_process_change(&ElementId::from("Task_3"), &at(1.0, 1.0), &mut timers));
        tracker.destroy(&mut timers);
        assert!(timers.is_empty());
        assert_eq!(tracker.stats().tracked, 0);
    }
}
