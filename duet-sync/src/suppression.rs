//! Silent mode: temporary interception of host change events.

use std::collections::HashSet;

use duet_core::{EventType, SceneHost};
use serde::{Deserialize, Serialize};

/// Event types captured when no explicit set is given.
pub const DEFAULT_SUPPRESSED: [EventType; 5] = [
    EventType::ElementChanged,
    EventType::ElementsChanged,
    EventType::ShapeChanged,
    EventType::ConnectionChanged,
    EventType::CommandStackChanged,
];

/// Suppression counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionStats {
    /// Times silent mode was entered.
    pub activations: u64,
    /// Events captured while active.
    pub suppressed: u64,
    /// Captured events delivered on release.
    pub flushed: u64,
    /// Captured events dropped on release.
    pub discarded: u64,
}

/// Installs and removes the event bus interception.
#[derive(Debug, Default)]
pub struct EventSuppressionManager {
    active: bool,
    stats: SuppressionStats,
}

impl EventSuppressionManager {
    /// Create an inactive manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start capturing `event_types` (or [`DEFAULT_SUPPRESSED`]).
    ///
    /// Returns false when an interception is already installed; nothing changes then.
    pub fn enable_silent_mode<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        event_types: Option<HashSet<EventType>>,
    ) -> bool {
        let suppressed = event_types.unwrap_or_else(|| DEFAULT_SUPPRESSED.into_iter().collect());
        if !host.events_mut().intercept(suppressed) {
            tracing::trace!("silent mode already active");
            return false;
        }
        self.active = true;
        self.stats.activations += 1;
        true
    }

    /// Stop capturing. With `flush`, captured events are delivered in
    /// timestamp order; otherwise they are dropped.
    ///
    /// Returns the number of events delivered.
    pub fn disable_silent_mode<H: SceneHost + ?Sized>(&mut self, host: &mut H, flush: bool) -> usize {
        if !self.active {
            return 0;
        }
        self.active = false;
        let Some(mut captured) = host.events_mut().release() else {
            return 0;
        };
        let count = captured.len() as u64;
        self.stats.suppressed += count;
        if !flush {
            self.stats.discarded += count;
            if count > 0 {
                tracing::debug!(discarded = count, "silent mode released");
            }
            return 0;
        }
        captured.sort_by_key(|e| (e.timestamp, e.sequence));
        let delivered = captured.len();
        for event in captured {
            host.events_mut().deliver(event);
        }
        self.stats.flushed += count;
        delivered
    }

    /// Run `f` with the default event types captured, discarding them afterwards.
    ///
    /// Silent mode is released when `f` returns or unwinds. Nested calls
    /// reuse the active interception and leave its release to the outer call.
    pub fn with_silent_mode<H, R>(&mut self, host: &mut H, f: impl FnOnce(&mut H) -> R) -> R
    where
        H: SceneHost + ?Sized,
    {
        let mut scope = SilentScope::enter(self, host);
        f(scope.host())
    }

    /// Whether this manager owns an active interception.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SuppressionStats {
        self.stats
    }

    /// Release any interception this manager owns, dropping what it captured.
    pub fn destroy<H: SceneHost + ?Sized>(&mut self, host: &mut H) {
        self.disable_silent_mode(host, false);
    }
}

/// Drop guard that releases silent mode.
struct SilentScope<'a, H: SceneHost + ?Sized> {
    manager: &'a mut EventSuppressionManager,
    host: &'a mut H,
    owned: bool,
}

impl<'a, H: SceneHost + ?Sized> SilentScope<'a, H> {
    fn enter(manager: &'a mut EventSuppressionManager, host: &'a mut H) -> Self {
        let owned = !host.events().is_intercepting() && manager.enable_silent_mode(&mut *host, None);
        Self {
            manager,
            host,
            owned,
        }
    }

    fn host(&mut self) -> &mut H {
        &mut *self.host
    }
}

impl<H: SceneHost + ?Sized> Drop for SilentScope<'_, H> {
    fn drop(&mut self) {
        if self.owned {
            self.manager.disable_silent_mode(&mut *self.host, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{Bounds, Element, ElementId, HostEvent, MemoryHost};

    fn host() -> MemoryHost {
        let mut host = MemoryHost::new();
        host.seed(Element::shape("Task_1", Bounds::default()))
            .expect("seed");
        host
    }

    fn changed(ts: u64) -> HostEvent {
        HostEvent::for_element(EventType::ShapeChanged, ElementId::from("Task_1"), ts)
    }

    #[test]
    fn test_suppressed_types_are_queued_others_pass() {
        let mut host = host();
        let mut manager = EventSuppressionManager::new();
        assert!(manager.enable_silent_mode(&mut host, None));
        host.emit(changed(1));
        host.emit(HostEvent::global(EventType::CanvasRedrawn, 2));
        assert_eq!(host.events().inbox_len(), 1);
        assert_eq!(manager.disable_silent_mode(&mut host, false), 0);
        assert_eq!(host.events().inbox_len(), 1);
        assert_eq!(manager.stats().discarded, 1);
    }

    #[test]
    fn test_flush_delivers_in_timestamp_order() {
        let mut host = host();
        let mut manager = EventSuppressionManager::new();
        manager.enable_silent_mode(&mut host, Some(HashSet::from([EventType::ShapeChanged])));
        host.emit(changed(30));
        host.emit(changed(10));
        host.emit(changed(20));
        assert_eq!(manager.disable_silent_mode(&mut host, true), 3);

        let stamps: Vec<_> = host
            .events_mut()
            .drain_inbox()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_with_silent_mode_is_reentrant() {
        let mut host = host();
        let mut manager = EventSuppressionManager::new();
        let mut inner = EventSuppressionManager::new();
        manager.with_silent_mode(&mut host, |host| {
            inner.with_silent_mode(host, |host| host.emit(changed(1)));
            assert!(host.events().is_intercepting());
            host.emit(changed(2));
        });
        assert!(!host.events().is_intercepting());
        assert_eq!(host.events().inbox_len(), 0);
        assert_eq!(manager.stats().discarded, 2);
        assert_eq!(inner.stats().activations, 0);
    }

    #[test]
    fn test_with_silent_mode_releases_on_panic() {
        let mut host = host();
        let mut manager = EventSuppressionManager::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.with_silent_mode(&mut host, |_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!host.events().is_intercepting());
        assert!(!manager.is_active());
    }

    #[test]
    fn test_enable_twice_is_a_noop() {
        let mut host = host();
        let mut manager = EventSuppressionManager::new();
        assert!(manager.enable_silent_mode(&mut host, None));
        assert!(!manager.enable_silent_mode(&mut host, None));
        assert_eq!(manager.stats().activations, 1);
    }
}
