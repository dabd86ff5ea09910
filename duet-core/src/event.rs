//! Host change events and the single emission entry point.
//!
//! Every event the host produces goes through [`EventBus::emit`]. An
//! [`Interception`] can be installed on the bus so that selected event types
//! are captured instead of delivered; this is how silent mode is implemented.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ElementId;

/// Type of a host event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Generic per-element change notification (render-internal).
    #[serde(rename = "element.changed")]
    ElementChanged,
    /// Aggregated change notification for several elements.
    #[serde(rename = "elements.changed")]
    ElementsChanged,
    /// Geometry or attributes of a shape changed.
    #[serde(rename = "shape.changed")]
    ShapeChanged,
    /// Route or attributes of a connection changed.
    #[serde(rename = "connection.changed")]
    ConnectionChanged,
    /// A shape was added.
    #[serde(rename = "shape.added")]
    ShapeAdded,
    /// A shape was removed.
    #[serde(rename = "shape.removed")]
    ShapeRemoved,
    /// A connection was added.
    #[serde(rename = "connection.added")]
    ConnectionAdded,
    /// A connection was removed.
    #[serde(rename = "connection.removed")]
    ConnectionRemoved,
    /// The command stack changed (execute, undo, redo).
    #[serde(rename = "commandStack.changed")]
    CommandStackChanged,
    /// The render tree was redrawn.
    #[serde(rename = "canvas.redrawn")]
    CanvasRedrawn,
}

impl EventType {
    /// Wire/log name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ElementChanged => "element.changed",
            Self::ElementsChanged => "elements.changed",
            Self::ShapeChanged => "shape.changed",
            Self::ConnectionChanged => "connection.changed",
            Self::ShapeAdded => "shape.added",
            Self::ShapeRemoved => "shape.removed",
            Self::ConnectionAdded => "connection.added",
            Self::ConnectionRemoved => "connection.removed",
            Self::CommandStackChanged => "commandStack.changed",
            Self::CanvasRedrawn => "canvas.redrawn",
        }
    }

    /// Whether the event reports an element mutation.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::CommandStackChanged | Self::CanvasRedrawn)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared source tag of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    /// Direct user interaction.
    User,
    /// Executed through a command stack.
    Command,
    /// A silent (non-broadcast) update.
    SilentUpdate,
    /// Applied on behalf of a remote collaborator.
    Collaboration,
}

/// An event emitted by the scene graph host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEvent {
    /// Event type.
    pub event_type: EventType,
    /// Element the event refers to, if any.
    pub element_id: Option<ElementId>,
    /// Declared source tag.
    pub source: Option<EventSource>,
    /// Host clock at emission (ms).
    pub timestamp: u64,
    /// Emission order, assigned by the bus.
    #[serde(default)]
    pub sequence: u64,
    /// Free-form payload.
    #[serde(default)]
    pub payload: Value,
}

impl HostEvent {
    /// Create an event for an element.
    #[must_use]
    pub fn for_element(event_type: EventType, element_id: ElementId, timestamp: u64) -> Self {
        Self {
            event_type,
            element_id: Some(element_id),
            source: None,
            timestamp,
            sequence: 0,
            payload: Value::Null,
        }
    }

    /// Create an event that does not refer to an element.
    #[must_use]
    pub fn global(event_type: EventType, timestamp: u64) -> Self {
        Self {
            event_type,
            element_id: None,
            source: None,
            timestamp,
            sequence: 0,
            payload: Value::Null,
        }
    }

    /// Set the source tag, builder style.
    #[must_use]
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the payload, builder style.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of [`EventBus::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// The event was delivered to listeners and the inbox.
    Delivered,
    /// The event was captured by an active interception.
    Captured,
}

/// Identifier returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&HostEvent)>;

struct Interception {
    suppressed: HashSet<EventType>,
    captured: Vec<HostEvent>,
}

/// The host's event channel.
///
/// Delivered events go to registered listeners and are also appended to an
/// inbox that the collaboration layer drains.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(ListenerId, Option<EventType>, Listener)>,
    inbox: VecDeque<HostEvent>,
    interception: Option<Interception>,
    next_listener: u64,
    next_sequence: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("inbox", &self.inbox.len())
            .field("intercepting", &self.interception.is_some())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event type.
    pub fn on(
        &mut self,
        event_type: EventType,
        listener: impl FnMut(&HostEvent) + 'static,
    ) -> ListenerId {
        self.register(Some(event_type), Box::new(listener))
    }

    /// Subscribe to every event type.
    pub fn on_any(&mut self, listener: impl FnMut(&HostEvent) + 'static) -> ListenerId {
        self.register(None, Box::new(listener))
    }

    fn register(&mut self, event_type: Option<EventType>, listener: Listener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, event_type, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id);
        self.listeners.len() != before
    }

    /// The single emission entry point.
    pub fn emit(&mut self, mut event: HostEvent) -> Emission {
        self.next_sequence += 1;
        event.sequence = self.next_sequence;

        if let Some(interception) = self.interception.as_mut() {
            if interception.suppressed.contains(&event.event_type) {
                interception.captured.push(event);
                return Emission::Captured;
            }
        }
        self.deliver(event);
        Emission::Delivered
    }

    /// Deliver an event, bypassing any interception.
    pub fn deliver(&mut self, event: HostEvent) {
        for (_, filter, listener) in &mut self.listeners {
            if filter.map_or(true, |t| t == event.event_type) {
                listener(&event);
            }
        }
        self.inbox.push_back(event);
    }

    /// Start capturing the given event types.
    ///
    /// Returns false (and changes nothing) if an interception is already installed.
    pub fn intercept(&mut self, suppressed: HashSet<EventType>) -> bool {
        if self.interception.is_some() {
            return false;
        }
        self.interception = Some(Interception {
            suppressed,
            captured: Vec::new(),
        });
        true
    }

    /// Remove the interception, returning the captured events in capture order.
    pub fn release(&mut self) -> Option<Vec<HostEvent>> {
        self.interception.take().map(|i| i.captured)
    }

    /// Whether an interception is installed.
    #[must_use]
    pub fn is_intercepting(&self) -> bool {
        self.interception.is_some()
    }

    /// Number of events captured by the current interception.
    #[must_use]
    pub fn captured_len(&self) -> usize {
        self.interception.as_ref().map_or(0, |i| i.captured.len())
    }

    /// Take every delivered event not yet consumed.
    pub fn drain_inbox(&mut self) -> Vec<HostEvent> {
        self.inbox.drain(..).collect()
    }

    /// Number of delivered events not yet consumed.
    #[must_use]
    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// Drop every pending inbox event.
    pub fn clear_inbox(&mut self) {
        self.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn changed(id: &str, ts: u64) -> HostEvent {
        HostEvent::for_element(EventType::ShapeChanged, ElementId::from(id), ts)
    }

    #[test]
    fn test_emit_delivers_to_matching_listeners() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.on(EventType::ShapeChanged, move |e| {
            sink.borrow_mut().push(e.event_type);
        });

        bus.emit(changed("Task_1", 1));
        bus.emit(HostEvent::global(EventType::CanvasRedrawn, 2));

        assert_eq!(*seen.borrow(), vec![EventType::ShapeChanged]);
        assert_eq!(bus.inbox_len(), 2);
    }

    #[test]
    fn test_interception_captures_only_suppressed_types() {
        let mut bus = EventBus::new();
        assert!(bus.intercept(HashSet::from([EventType::ShapeChanged])));
        assert!(!bus.intercept(HashSet::new()));

        assert_eq!(bus.emit(changed("Task_1", 1)), Emission::Captured);
        assert_eq!(
            bus.emit(HostEvent::global(EventType::CanvasRedrawn, 2)),
            Emission::Delivered
        );
        assert_eq!(bus.captured_len(), 1);
        assert_eq!(bus.inbox_len(), 1);

        let captured = bus.release().expect("interception installed");
        assert_eq!(captured.len(), 1);
        assert!(!bus.is_intercepting());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut bus = EventBus::new();
        bus.emit(changed("a", 5));
        bus.emit(changed("b", 5));
        let events = bus.drain_inbox();
        assert!(events[0].sequence < events[1].sequence);
    }

    #[test]
    fn test_off_removes_listener() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        let id = bus.on_any(move |_| *c.borrow_mut() += 1);
        bus.emit(changed("a", 1));
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(changed("a", 2));
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_event_type_serializes_to_dotted_name() {
        let json = serde_json::to_string(&EventType::CommandStackChanged).expect("serialize");
        assert_eq!(json, "\"commandStack.changed\"");
        assert_eq!(EventType::ShapeChanged.to_string(), "shape.changed");
    }
}
