//! The host's normal mutating API.
//!
//! Functions here mutate the document, redraw the affected graphics and emit
//! change events through [`SceneHost::emit`]. The `*_silently` helpers perform
//! the same structural work without emitting anything and are the building
//! blocks for silent application of remote changes.

use serde_json::{Map, Value};

use crate::{
    Bounds, CoreError, CoreResult, Element, ElementId, ElementKind, EventSource, EventType,
    HostEvent, Point, SceneHost,
};

/// Event type reported when an element of `kind` changes.
#[must_use]
pub const fn change_event_type(kind: ElementKind) -> EventType {
    match kind {
        ElementKind::Connection => EventType::ConnectionChanged,
        ElementKind::Root | ElementKind::Shape | ElementKind::Label => EventType::ShapeChanged,
    }
}

fn emit_for<H: SceneHost + ?Sized>(
    host: &mut H,
    event_type: EventType,
    id: &ElementId,
    source: EventSource,
) {
    let event = HostEvent::for_element(event_type, id.clone(), host.now()).with_source(source);
    host.emit(event);
}

fn kind_of<H: SceneHost + ?Sized>(host: &H, id: &ElementId) -> CoreResult<ElementKind> {
    host.get_element(id)
        .map(|e| e.kind)
        .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))
}

/// Insert an element, link it to its connection endpoints, create its
/// graphics and attach it under `parent` (or its declared parent, or the root).
///
/// # Errors
///
/// Returns an error if the id is taken or the parent is missing.
pub fn insert_silently<H: SceneHost + ?Sized>(
    host: &mut H,
    element: Element,
    parent: Option<&ElementId>,
) -> CoreResult<ElementId> {
    let id = element.id.clone();
    let parent = parent
        .cloned()
        .or_else(|| element.parent.clone())
        .unwrap_or_else(|| host.root_id().clone());
    if host.get_element(&parent).is_none() {
        return Err(CoreError::ElementNotFound(parent.to_string()));
    }
    let (source, target) = (element.source.clone(), element.target.clone());
    host.insert_element(element)?;

    if let Some(source) = source {
        if let Some(source) = host.get_element_mut(&source) {
            if !source.outgoing.contains(&id) {
                source.outgoing.push(id.clone());
            }
        }
    }
    if let Some(target) = target {
        if let Some(target) = host.get_element_mut(&target) {
            if !target.incoming.contains(&id) {
                target.incoming.push(id.clone());
            }
        }
    }

    host.create_render_handle(&id)?;
    host.attach_element(&id, &parent)?;
    Ok(id)
}

/// Remove an element together with its descendants and every connection
/// touching any of them. Returns the removed elements, outermost first.
///
/// # Errors
///
/// Returns an error if the element is missing or is the root.
pub fn remove_silently<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
) -> CoreResult<Vec<Element>> {
    if id == host.root_id() {
        return Err(CoreError::InvalidOperation("the root cannot be removed".into()));
    }
    if host.get_element(id).is_none() {
        return Err(CoreError::ElementNotFound(id.to_string()));
    }

    let mut doomed = Vec::new();
    collect_subtree(host, id, &mut doomed);

    let mut removed = Vec::with_capacity(doomed.len());
    for target in doomed {
        // Already removed as part of an earlier entry.
        if host.get_element(&target).is_none() {
            continue;
        }
        host.detach_element(&target)?;
        host.remove_render_handle(&target);
        if let Some(element) = host.take_element(&target) {
            unlink_endpoints(host, &element);
            removed.push(element);
        }
    }
    Ok(removed)
}

fn collect_subtree<H: SceneHost + ?Sized>(host: &H, id: &ElementId, out: &mut Vec<ElementId>) {
    if out.contains(id) {
        return;
    }
    out.push(id.clone());
    let Some(element) = host.get_element(id) else {
        return;
    };
    let linked: Vec<ElementId> = element
        .children
        .iter()
        .chain(&element.incoming)
        .chain(&element.outgoing)
        .cloned()
        .collect();
    for next in linked {
        collect_subtree(host, &next, out);
    }
}

fn unlink_endpoints<H: SceneHost + ?Sized>(host: &mut H, element: &Element) {
    for endpoint in [&element.source, &element.target].into_iter().flatten() {
        if let Some(endpoint) = host.get_element_mut(endpoint) {
            endpoint.outgoing.retain(|c| *c != element.id);
            endpoint.incoming.retain(|c| *c != element.id);
        }
    }
}

/// Add a shape or connection and announce it.
///
/// # Errors
///
/// See [`insert_silently`].
pub fn add_element<H: SceneHost + ?Sized>(
    host: &mut H,
    element: Element,
    parent: Option<&ElementId>,
    source: EventSource,
) -> CoreResult<ElementId> {
    let kind = element.kind;
    let id = insert_silently(host, element, parent)?;
    let event_type = if kind == ElementKind::Connection {
        EventType::ConnectionAdded
    } else {
        EventType::ShapeAdded
    };
    emit_for(host, event_type, &id, source);
    Ok(id)
}

/// Remove an element (and everything depending on it) and announce each removal.
///
/// # Errors
///
/// See [`remove_silently`].
pub fn remove_element<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
    source: EventSource,
) -> CoreResult<Vec<Element>> {
    let removed = remove_silently(host, id)?;
    for element in &removed {
        let event_type = if element.is_connection() {
            EventType::ConnectionRemoved
        } else {
            EventType::ShapeRemoved
        };
        emit_for(host, event_type, &element.id, source);
    }
    Ok(removed)
}

/// Replace a shape's bounds. Returns the previous bounds.
///
/// # Errors
///
/// Returns an error if the element is missing or its graphics cannot be updated.
pub fn set_bounds<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
    bounds: Bounds,
    source: EventSource,
) -> CoreResult<Bounds> {
    let kind = kind_of(host, id)?;
    let element = host
        .get_element_mut(id)
        .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?;
    let previous = std::mem::replace(&mut element.bounds, bounds);
    host.update_render_handle(id)?;
    emit_for(host, change_event_type(kind), id, source);
    Ok(previous)
}

/// Move a shape by a delta.
///
/// # Errors
///
/// See [`set_bounds`].
pub fn move_shape<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
    dx: f64,
    dy: f64,
    source: EventSource,
) -> CoreResult<Bounds> {
    let current = host
        .get_element(id)
        .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?
        .bounds;
    let moved = Bounds {
        x: current.x + dx,
        y: current.y + dy,
        ..current
    };
    set_bounds(host, id, moved, source)
}

/// Set business attributes. A `null` value removes the attribute.
///
/// Returns the previous value of every touched key (`null` when it was unset).
///
/// # Errors
///
/// Returns an error if the element is missing, has no model object, or its
/// graphics cannot be updated.
pub fn update_properties<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
    attrs: &Map<String, Value>,
    source: EventSource,
) -> CoreResult<Map<String, Value>> {
    let kind = kind_of(host, id)?;
    let business_object = host
        .get_element_mut(id)
        .and_then(|e| e.business_object.as_mut())
        .ok_or_else(|| CoreError::InvalidOperation(format!("{id} has no model object")))?;

    let mut previous = Map::new();
    for (key, value) in attrs {
        let old = if value.is_null() {
            business_object.attrs.remove(key)
        } else {
            business_object.attrs.insert(key.clone(), value.clone())
        };
        previous.insert(key.clone(), old.unwrap_or(Value::Null));
    }
    host.update_render_handle(id)?;
    emit_for(host, change_event_type(kind), id, source);
    Ok(previous)
}

/// Replace a connection's route. Returns the previous waypoints.
///
/// # Errors
///
/// Returns an error if the element is missing, is not a connection, or its
/// graphics cannot be updated.
pub fn set_waypoints<H: SceneHost + ?Sized>(
    host: &mut H,
    id: &ElementId,
    waypoints: Vec<Point>,
    source: EventSource,
) -> CoreResult<Vec<Point>> {
    let element = host
        .get_element_mut(id)
        .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?;
    if !element.is_connection() {
        return Err(CoreError::InvalidOperation(format!("{id} is not a connection")));
    }
    let previous = std::mem::replace(&mut element.waypoints, waypoints);
    host.update_render_handle(id)?;
    emit_for(host, EventType::ConnectionChanged, id, source);
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHost;

    fn diagram() -> MemoryHost {
        let mut host = MemoryHost::new();
        host.seed(Element::shape("Start_1", Bounds::new(0.0, 0.0, 36.0, 36.0)))
            .expect("seed");
        host.seed(Element::shape("Task_1", Bounds::new(100.0, 0.0, 100.0, 80.0)))
            .expect("seed");
        host.seed(Element::connection(
            "Flow_1",
            "Start_1".into(),
            "Task_1".into(),
            vec![Point::new(36.0, 18.0), Point::new(100.0, 40.0)],
        ))
        .expect("seed");
        host
    }

    #[test]
    fn test_move_shape_emits_shape_changed_with_source() {
        let mut host = diagram();
        let id = ElementId::from("Task_1");
        move_shape(&mut host, &id, 10.0, 5.0, EventSource::User).expect("move");

        let bounds = host.get_element(&id).expect("task").bounds;
        assert_eq!((bounds.x, bounds.y), (110.0, 5.0));

        let events = host.events_mut().drain_inbox();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ShapeChanged);
        assert_eq!(events[0].source, Some(EventSource::User));
    }

    #[test]
    fn test_update_properties_returns_previous_values() {
        let mut host = diagram();
        let id = ElementId::from("Task_1");
        let mut attrs = Map::new();
        attrs.insert("name".into(), Value::from("Review"));
        let previous =
            update_properties(&mut host, &id, &attrs, EventSource::Command).expect("update");
        assert_eq!(previous["name"], Value::Null);

        attrs.insert("name".into(), Value::Null);
        let previous =
            update_properties(&mut host, &id, &attrs, EventSource::Command).expect("update");
        assert_eq!(previous["name"], "Review");
        let bo = host
            .get_element(&id)
            .and_then(|e| e.business_object.as_ref())
            .expect("bo");
        assert!(bo.name().is_none());
    }

    #[test]
    fn test_set_waypoints_rejects_shapes() {
        let mut host = diagram();
        let err = set_waypoints(&mut host, &"Task_1".into(), vec![], EventSource::User)
            .expect_err("not a connection");
        assert!(matches!(err, CoreError::InvalidOperation(_)));
    }

    #[test]
    fn test_remove_shape_cascades_to_connections() {
        let mut host = diagram();
        let removed =
            remove_element(&mut host, &"Task_1".into(), EventSource::User).expect("remove");
        let ids: Vec<_> = removed.iter().map(|e| e.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["Task_1", "Flow_1"]);
        assert!(host.get_element(&"Flow_1".into()).is_none());

        let start = host.get_element(&"Start_1".into()).expect("start");
        assert!(start.outgoing.is_empty());

        let kinds: Vec<_> = host
            .events_mut()
            .drain_inbox()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventType::ShapeRemoved, EventType::ConnectionRemoved]);
    }

    #[test]
    fn test_insert_silently_links_endpoints_without_events() {
        let mut host = diagram();
        let flow = Element::connection("Flow_2", "Task_1".into(), "Start_1".into(), vec![]);
        insert_silently(&mut host, flow, None).expect("insert");
        assert!(host
            .get_element(&"Task_1".into())
            .expect("task")
            .outgoing
            .contains(&"Flow_2".into()));
        assert_eq!(host.events().inbox_len(), 0);
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut host = diagram();
        let root = host.root_id().clone();
        assert!(matches!(
            remove_silently(&mut host, &root),
            Err(CoreError::InvalidOperation(_))
        ));
    }
}
