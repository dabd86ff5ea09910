//! Per-document collaboration state.
//!
//! One [`CollaborationContext`] exists per document session and is passed by
//! reference to every component that needs it. Nothing here is global, so
//! several documents can be edited side by side without interfering.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use duet_core::{ElementId, SceneHost};
use serde::{Deserialize, Serialize};

use crate::applier::SilentMutationApplier;
use crate::operation::ChangeOperation;
use crate::scheduler::{TaskId, TimerTask, Timers};
use crate::suppression::EventSuppressionManager;
use crate::tracker::ChangeTracker;

/// Phase of an element with respect to remote application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementPhase {
    /// Not being touched by a remote application.
    #[default]
    Idle,
    /// A remote operation is being applied to it.
    RemoteApplying,
}

/// Collaboration state of one document.
#[derive(Debug, Default)]
pub struct CollaborationContext {
    processing_remote: bool,
    applying: HashMap<ElementId, ElementPhase>,
    markers: HashMap<ElementId, u64>,
    release_timers: Vec<TaskId>,
    outbound: VecDeque<ChangeOperation>,
}

impl CollaborationContext {
    /// Create an idle context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a remote application is in progress.
    ///
    /// While true every locally observed change event is discarded.
    #[must_use]
    pub fn is_processing_remote_event(&self) -> bool {
        self.processing_remote
    }

    /// Phase of an element.
    #[must_use]
    pub fn phase(&self, element_id: &ElementId) -> ElementPhase {
        self.applying.get(element_id).copied().unwrap_or_default()
    }

    /// Mark elements as remotely applied until `expires_at`.
    pub fn mark(&mut self, element_ids: &[ElementId], expires_at: u64) {
        for id in element_ids {
            let expiry = self.markers.entry(id.clone()).or_insert(expires_at);
            *expiry = (*expiry).max(expires_at);
        }
    }

    /// Consume the marker of an element. Returns whether one was present.
    pub fn consume_marker(&mut self, element_id: &ElementId) -> bool {
        self.markers.remove(element_id).is_some()
    }

    /// Whether an element carries a marker.
    #[must_use]
    pub fn is_marked(&self, element_id: &ElementId) -> bool {
        self.markers.contains_key(element_id)
    }

    /// Drop the markers of `element_ids` that expired by `now`.
    ///
    /// Called when the release timer `task` fires. Markers refreshed by a
    /// later application survive.
    pub fn release_markers(&mut self, task: TaskId, element_ids: &[ElementId], now: u64) -> usize {
        self.release_timers.retain(|t| *t != task);
        let mut released = 0;
        for id in element_ids {
            if self.markers.get(id).is_some_and(|expiry| *expiry <= now) {
                self.markers.remove(id);
                released += 1;
            }
        }
        released
    }

    /// Number of live markers.
    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Enter remote processing for `element_ids`.
    ///
    /// The returned scope clears the flag and returns the elements to
    /// [`ElementPhase::Idle`] when dropped, also on unwind.
    pub fn begin_remote(&mut self, element_ids: &[ElementId]) -> RemoteScope<'_> {
        let previous = std::mem::replace(&mut self.processing_remote, true);
        for id in element_ids {
            self.applying.insert(id.clone(), ElementPhase::RemoteApplying);
        }
        RemoteScope {
            context: self,
            element_ids: element_ids.to_vec(),
            previous,
        }
    }

    /// Queue an operation for broadcast.
    pub fn push_outbound(&mut self, operation: ChangeOperation) {
        self.outbound.push_back(operation);
    }

    /// Take every operation waiting for broadcast.
    pub fn take_outbound(&mut self) -> Vec<ChangeOperation> {
        self.outbound.drain(..).collect()
    }

    /// Number of operations waiting for broadcast.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Run `f` as a remote application touching `element_ids`.
    ///
    /// The elements are marked for `ignore_for`, the remote flag is raised,
    /// and the default event types are suppressed while `f` runs. Events
    /// delivered meanwhile are discarded. A timer releases the markers once
    /// the window has passed. Returns `f`'s result and the number of
    /// discarded events.
    pub fn apply_remotely<H, R>(
        &mut self,
        env: ApplyContext<'_, H>,
        element_ids: Vec<ElementId>,
        ignore_for: Duration,
        f: impl FnOnce(&mut H, &mut Appliers<'_>) -> R,
    ) -> (R, usize)
    where
        H: SceneHost + ?Sized,
    {
        let ApplyContext {
            host,
            tracker,
            applier,
            suppression,
            timers,
        } = env;
        #[allow(clippy::cast_possible_truncation)]
        let expires_at = timers.now() + ignore_for.as_millis() as u64;
        self.mark(&element_ids, expires_at);

        let (result, discarded, task) = {
            let _remote = self.begin_remote(&element_ids);
            let mut appliers = Appliers {
                tracker,
                applier,
                timers,
            };
            let result = suppression.with_silent_mode(&mut *host, |host| f(host, &mut appliers));
            let discarded = host.events_mut().drain_inbox().len();
            let task = appliers
                .timers
                .schedule(ignore_for, TimerTask::ReleaseRemoteMarkers(element_ids.clone()));
            (result, discarded, task)
        };
        self.release_timers.push(task);
        if discarded > 0 {
            tracing::trace!(discarded, "events observed during remote application dropped");
        }
        (result, discarded)
    }

    /// Cancel pending marker releases and drop all state.
    pub fn destroy(&mut self, timers: &mut Timers) {
        for task in self.release_timers.drain(..) {
            timers.cancel(task);
        }
        self.processing_remote = false;
        self.applying.clear();
        self.markers.clear();
        self.outbound.clear();
    }
}

/// Active remote processing; see [`CollaborationContext::begin_remote`].
pub struct RemoteScope<'a> {
    context: &'a mut CollaborationContext,
    element_ids: Vec<ElementId>,
    previous: bool,
}

impl Deref for RemoteScope<'_> {
    type Target = CollaborationContext;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for RemoteScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for RemoteScope<'_> {
    fn drop(&mut self) {
        self.context.processing_remote = self.previous;
        if !self.previous {
            for id in &self.element_ids {
                self.context.applying.remove(id);
            }
        }
    }
}

/// Mutable borrows of everything needed to apply operations to a document.
///
/// The session owns all of these and lends them out together for one call.
pub struct ApplyContext<'a, H: SceneHost + ?Sized> {
    /// The scene graph host.
    pub host: &'a mut H,
    /// Change tracker.
    pub tracker: &'a mut ChangeTracker,
    /// Silent applier.
    pub applier: &'a mut SilentMutationApplier,
    /// Event suppression.
    pub suppression: &'a mut EventSuppressionManager,
    /// Timers.
    pub timers: &'a mut Timers,
}

/// What an operation handler may touch besides the host.
pub struct Appliers<'a> {
    /// Change tracker.
    pub tracker: &'a mut ChangeTracker,
    /// Silent applier.
    pub applier: &'a mut SilentMutationApplier,
    /// Timers.
    pub timers: &'a mut Timers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_scope_restores_flag() {
        let mut ctx = CollaborationContext::new();
        let ids = vec![ElementId::from("Task_1")];
        {
            let scope = ctx.begin_remote(&ids);
            assert!(scope.is_processing_remote_event());
            assert_eq!(scope.phase(&ids[0]), ElementPhase::RemoteApplying);
        }
        assert!(!ctx.is_processing_remote_event());
        assert_eq!(ctx.phase(&ids[0]), ElementPhase::Idle);
    }

    #[test]
    fn test_nested_scope_keeps_outer_flag() {
        let mut ctx = CollaborationContext::new();
        let ids = vec![ElementId::from("Task_1")];
        let mut outer = ctx.begin_remote(&ids);
        {
            let inner = outer.begin_remote(&ids);
            drop(inner);
        }
        assert!(outer.is_processing_remote_event());
        drop(outer);
        assert!(!ctx.is_processing_remote_event());
    }

    #[test]
    fn test_markers_are_one_shot() {
        let mut ctx = CollaborationContext::new();
        let id = ElementId::from("Task_1");
        ctx.mark(std::slice::from_ref(&id), 100);
        assert!(ctx.consume_marker(&id));
        assert!(!ctx.consume_marker(&id));
    }

    #[test]
    fn test_refreshed_marker_survives_early_release() {
        let mut ctx = CollaborationContext::new();
        let id = ElementId::from("Task_1");
        let mut timers = Timers::new();
        let first = timers.schedule(Duration::from_millis(100), TimerTask::ProcessQueue);
        let second = timers.schedule(Duration::from_millis(150), TimerTask::ProcessQueue);
        ctx.mark(std::slice::from_ref(&id), 100);
        ctx.mark(std::slice::from_ref(&id), 150);
        assert_eq!(ctx.release_markers(first, std::slice::from_ref(&id), 100), 0);
        assert!(ctx.is_marked(&id));
        assert_eq!(ctx.release_markers(second, std::slice::from_ref(&id), 150), 1);
    }
}
