//! Behaviour every `SceneHost` must show, checked against `MemoryHost`
//! through the trait only.

use duet_core::{
    modeling, Bounds, DiagramDocument, Element, ElementId, EventSource, EventType, MemoryHost,
    Point, SceneHost,
};
use proptest::prelude::*;

fn diagram() -> MemoryHost {
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
    host
}

fn check_render_update_is_announced_later<H: SceneHost>(host: &mut H) {
    let id = ElementId::from("Task_1");
    host.events_mut().clear_inbox();
    host.update_render_handle(&id).expect("update");
    assert_eq!(host.events().inbox_len(), 0, "graphics change must not be announced synchronously");
    assert_eq!(host.flush_deferred(), 1);
    let events = host.events_mut().drain_inbox();
    assert_eq!(events[0].event_type, EventType::ElementChanged);
    assert_eq!(events[0].element_id.as_ref(), Some(&id));
    assert_eq!(events[0].source, None);
}

fn check_silent_insert_emits_nothing<H: SceneHost>(host: &mut H) {
    host.events_mut().clear_inbox();
    modeling::insert_silently(host, Element::shape("Task_9", Bounds::default()), None)
        .expect("insert");
    host.flush_deferred();
    assert_eq!(host.events().inbox_len(), 0);
    let root = host.root_id().clone();
    assert!(host
        .get_element(&root)
        .is_some_and(|r| r.children.contains(&"Task_9".into())));
    assert!(host.render_handle(&"Task_9".into()).is_some_and(|h| h.attached));
}

fn check_interception_captures_changes<H: SceneHost>(host: &mut H) {
    host.events_mut().clear_inbox();
    assert!(host
        .events_mut()
        .intercept([EventType::ShapeChanged].into_iter().collect()));
    modeling::move_shape(host, &"Task_2".into(), 5.0, 0.0, EventSource::User).expect("move");
    assert_eq!(host.events().captured_len(), 1);
    assert_eq!(host.events().inbox_len(), 0);
    let captured = host.events_mut().release().expect("interception active");
    assert_eq!(captured[0].source, Some(EventSource::User));
}

#[test]
fn test_memory_host_satisfies_contract() {
    let mut host = diagram();
    check_render_update_is_announced_later(&mut host);
    check_silent_insert_emits_nothing(&mut host);
    check_interception_captures_changes(&mut host);
}

#[test]
fn test_nested_suspension_redraws_once() {
    let mut host = diagram();
    host.reset_render_stats();
    host.suspend_rendering();
    host.suspend_rendering();
    host.update_render_handle(&"Task_1".into()).expect("update");
    host.resume_rendering();
    assert_eq!(host.render_stats().redraws, 0);
    host.resume_rendering();
    assert_eq!(host.render_stats().redraws, 1);
    assert_eq!(host.render_stats().deferred_updates, 1);
}

#[test]
fn test_snapshot_reloads_into_equal_document() {
    let host = diagram();
    let snapshot = DiagramDocument::from_host(&host);
    let json = snapshot.to_json().expect("serialize");
    let reloaded = DiagramDocument::from_json(&json)
        .and_then(DiagramDocument::into_host)
        .expect("reload");
    assert_eq!(
        DiagramDocument::from_host(&reloaded).to_json().expect("serialize"),
        json
    );
    let flow = reloaded.get_element(&"Flow_1".into()).expect("flow");
    assert_eq!(flow.source, Some("Task_1".into()));
    assert!(reloaded
        .get_element(&"Task_2".into())
        .is_some_and(|t| t.incoming.contains(&"Flow_1".into())));
}

proptest! {
    #[test]
    fn prop_moves_accumulate(moves in prop::collection::vec((-50i32..50, -50i32..50), 1..20)) {
        let mut host = diagram();
        let id = ElementId::from("Task_1");
        for (dx, dy) in &moves {
            modeling::move_shape(&mut host, &id, f64::from(*dx), f64::from(*dy), EventSource::User)
                .expect("move");
        }
        let (sx, sy) = moves.iter().fold((0i32, 0i32), |(x, y), (dx, dy)| (x + dx, y + dy));
        let bounds = host.get_element(&id).expect("task").bounds;
        prop_assert_eq!(bounds.x, 100.0 + f64::from(sx));
        prop_assert_eq!(bounds.y, 100.0 + f64::from(sy));
        prop_assert_eq!(host.flush_deferred(), moves.len());
    }
}
