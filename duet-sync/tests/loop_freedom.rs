//! Property tests: remote traffic never turns into local broadcasts, and the
//! sync queue stays within its cap.

use std::time::Duration;

use duet_core::{Bounds, Element, MemoryHost, Point};
use duet_sync::{ChangeOperation, ChangePayload, CollabSession, SyncConfig, VisualChange};
use proptest::prelude::*;
use serde_json::{json, Map};

const SHAPES: [&str; 3] = ["Task_1", "Task_2", "Gateway_1"];

fn session() -> CollabSession<MemoryHost> {
    let mut host = MemoryHost::new();
    for (i, id) in SHAPES.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let x = 100.0 + 200.0 * i as f64;
        host.seed(Element::shape(*id, Bounds::new(x, 100.0, 100.0, 80.0)))
            .expect("seed");
    }
    host.seed(Element::connection(
        "Flow_1",
        "Task_1".into(),
        "Task_2".into(),
        vec![Point::new(200.0, 140.0), Point::new(300.0, 140.0)],
    ))
    .expect("seed");
    let mut session = CollabSession::new(host, SyncConfig::default());
    session.start();
    session
}

fn remote_op() -> impl Strategy<Value = ChangeOperation> {
    let shape = prop::sample::select(SHAPES.to_vec());
    prop_oneof![
        (shape.clone(), 0.0..1_000.0f64, 0.0..1_000.0f64).prop_map(|(id, x, y)| {
            ChangeOperation::update(id, ChangePayload::visual(VisualChange::position(x, y)))
        }),
        (shape, "[A-Za-z ]{1,12}").prop_map(|(id, name)| {
            let mut attrs = Map::new();
            attrs.insert("name".into(), json!(name));
            ChangeOperation::update(id, ChangePayload::attributes(attrs))
        }),
        prop::collection::vec((0.0..1_000.0f64, 0.0..1_000.0f64), 2..5).prop_map(|points| {
            ChangeOperation::connection_update(
                "Flow_1",
                points.into_iter().map(|(x, y)| Point::new(x, y)).collect(),
            )
        }),
    ]
}

#[derive(Debug, Clone)]
enum Delivery {
    Apply(Vec<ChangeOperation>),
    Queue(ChangeOperation),
}

fn delivery() -> impl Strategy<Value = (Delivery, u64)> {
    (
        prop_oneof![
            prop::collection::vec(remote_op(), 1..4).prop_map(Delivery::Apply),
            remote_op().prop_map(Delivery::Queue),
            prop::collection::vec(remote_op(), 1..4)
                .prop_map(|ops| Delivery::Apply(vec![ChangeOperation::batch(ops)])),
        ],
        0u64..300,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_remote_traffic_is_never_rebroadcast(deliveries in prop::collection::vec(delivery(), 1..25)) {
        let mut s = session();
        for (delivery, gap_ms) in deliveries {
            match delivery {
                Delivery::Apply(ops) => {
                    s.apply_remote_changes(&ops);
                }
                Delivery::Queue(op) => {
                    s.queue_sync(op);
                }
            }
            s.advance_by(Duration::from_millis(gap_ms));
            let outbound = s.take_outbound();
            prop_assert!(outbound.is_empty(), "echoed: {:?}", outbound);
        }
        s.advance_by(Duration::from_secs(6));
        prop_assert!(s.take_outbound().is_empty());
        prop_assert_eq!(s.status().queue_size, 0);
        prop_assert!(s.validate_sync().is_empty());
        prop_assert!(!s.history().undo_redo_status().can_undo);
    }

    #[test]
    fn prop_queue_never_exceeds_capacity(count in 0usize..400, capacity in 1usize..120) {
        let config = SyncConfig { queue_capacity: capacity, ..SyncConfig::default() };
        let mut s = CollabSession::new(MemoryHost::new(), config);
        for i in 0..count {
            s.queue_sync(ChangeOperation::update(
                format!("Shape_{i}"),
                ChangePayload::visual(VisualChange::position(1.0, 1.0)),
            ));
            prop_assert!(s.status().queue_size <= capacity);
        }
        prop_assert_eq!(s.stats().sync.evicted as usize, count.saturating_sub(capacity));
    }
}
