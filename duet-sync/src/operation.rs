//! Change operations and their wire format.
//!
//! ## Wire format
//!
//! ```text
//! {"type": "updateElement", "elementId": "Task_1",
//!  "changes": {"businessObject": {...}, "visual": {"x": 300, "y": 200}},
//!  "timestamp": 1700000000000, "origin": "remote"}
//!
//! {"type": "batch_update", "updates": [ ... ]}
//! ```
//!
//! Type tags: `createElement`, `updateElement`, `removeElement`,
//! `updateConnection`, `batch_update`.

use std::time::{SystemTime, UNIX_EPOCH};

use duet_core::{Bounds, Element, ElementId, ElementKind, Point};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::SyncResult;

/// Keys holding structural back-references. They never take part in equality checks.
pub const STRUCTURAL_KEYS: &[&str] = &["parent", "children", "incoming", "outgoing", "source", "target"];

/// Unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create an element.
    #[serde(rename = "createElement")]
    Create,
    /// Update attributes and/or geometry of an element.
    #[serde(rename = "updateElement")]
    Update,
    /// Remove an element.
    #[serde(rename = "removeElement")]
    Remove,
    /// Replace a connection's waypoints.
    #[serde(rename = "updateConnection")]
    ConnectionUpdate,
    /// Several operations applied with rendering suspended.
    #[serde(rename = "batch_update")]
    Batch,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Create,
        Self::Update,
        Self::Remove,
        Self::ConnectionUpdate,
        Self::Batch,
    ];

    /// Wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "createElement",
            Self::Update => "updateElement",
            Self::Remove => "removeElement",
            Self::ConnectionUpdate => "updateConnection",
            Self::Batch => "batch_update",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an operation was authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Authored by this editor.
    Local,
    /// Received from a collaborator.
    #[default]
    Remote,
}

/// Partial geometry change. Absent fields are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VisualChange {
    /// New X position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// New Y position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// New width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// New height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl VisualChange {
    /// A position-only change.
    #[must_use]
    pub const fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            width: None,
            height: None,
        }
    }

    /// A full change describing `bounds`.
    #[must_use]
    pub const fn from_bounds(bounds: Bounds) -> Self {
        Self {
            x: Some(bounds.x),
            y: Some(bounds.y),
            width: Some(bounds.width),
            height: Some(bounds.height),
        }
    }

    /// Apply onto existing bounds.
    #[must_use]
    pub fn applied_to(&self, bounds: Bounds) -> Bounds {
        Bounds {
            x: self.x.unwrap_or(bounds.x),
            y: self.y.unwrap_or(bounds.y),
            width: self.width.unwrap_or(bounds.width),
            height: self.height.unwrap_or(bounds.height),
        }
    }

    /// Whether any field present in both changes differs by more than `threshold`.
    #[must_use]
    pub fn differs_from(&self, other: &Self, threshold: f64) -> bool {
        let pairs = [
            (self.x, other.x),
            (self.y, other.y),
            (self.width, other.width),
            (self.height, other.height),
        ];
        pairs.iter().any(|pair| match *pair {
            (Some(a), Some(b)) => (a - b).abs() > threshold,
            (Some(_), None) => true,
            _ => false,
        })
    }

    fn merge(&mut self, later: Self) {
        self.x = later.x.or(self.x);
        self.y = later.y.or(self.y);
        self.width = later.width.or(self.width);
        self.height = later.height.or(self.height);
    }
}

/// Descriptor of the element a `createElement` operation constructs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSpec {
    /// Structural role.
    pub kind: ElementKind,
    /// Model object type tag; the kind's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    /// Parent element; the root when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ElementId>,
    /// Connection source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ElementId>,
    /// Connection target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ElementId>,
}

/// The `changes` object of an operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    /// Business attribute changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_object: Option<Map<String, Value>>,
    /// Geometry changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual: Option<VisualChange>,
    /// New connection route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waypoints: Option<Vec<Point>>,
    /// Element descriptor (create operations only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSpec>,
}

impl ChangePayload {
    /// Payload describing the full observable state of an element.
    ///
    /// Connection waypoints are rounded to integers so peers do not churn on
    /// floating-point noise.
    #[must_use]
    pub fn from_element(element: &Element) -> Self {
        let business_object = element.business_object.as_ref().map(|bo| bo.to_attr_map());
        if element.is_connection() {
            Self {
                business_object,
                waypoints: Some(element.waypoints.iter().map(|p| p.rounded()).collect()),
                ..Self::default()
            }
        } else {
            Self {
                business_object,
                visual: Some(VisualChange::from_bounds(element.bounds)),
                ..Self::default()
            }
        }
    }

    /// Payload for creating `element` elsewhere.
    #[must_use]
    pub fn for_create(element: &Element) -> Self {
        let mut payload = Self::from_element(element);
        payload.element = Some(ElementSpec {
            kind: element.kind,
            type_tag: element.business_object.as_ref().map(|bo| bo.type_tag.clone()),
            parent: element.parent.clone(),
            source: element.source.clone(),
            target: element.target.clone(),
        });
        payload
    }

    /// Business attribute change only.
    #[must_use]
    pub fn attributes(attrs: Map<String, Value>) -> Self {
        Self {
            business_object: Some(attrs),
            ..Self::default()
        }
    }

    /// Geometry change only.
    #[must_use]
    pub fn visual(visual: VisualChange) -> Self {
        Self {
            visual: Some(visual),
            ..Self::default()
        }
    }

    /// Waypoint change only.
    #[must_use]
    pub fn waypoints(waypoints: Vec<Point>) -> Self {
        Self {
            waypoints: Some(waypoints),
            ..Self::default()
        }
    }

    /// Whether the payload carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.business_object.is_none()
            && self.visual.is_none()
            && self.waypoints.is_none()
            && self.element.is_none()
    }

    /// Fold a later payload into this one; the later value of every key wins.
    pub fn merge(&mut self, later: Self) {
        if let Some(attrs) = later.business_object {
            self.business_object
                .get_or_insert_with(Map::new)
                .extend(attrs);
        }
        if let Some(visual) = later.visual {
            match self.visual.as_mut() {
                Some(current) => current.merge(visual),
                None => self.visual = Some(visual),
            }
        }
        if later.waypoints.is_some() {
            self.waypoints = later.waypoints;
        }
        if later.element.is_some() {
            self.element = later.element;
        }
    }

    /// Deep JSON snapshot with structural back-reference keys removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn snapshot(&self) -> SyncResult<Value> {
        let mut value = serde_json::to_value(self)?;
        strip_structural_keys(&mut value);
        Ok(value)
    }
}

/// Remove [`STRUCTURAL_KEYS`] from every object nested in `value`.
pub fn strip_structural_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !STRUCTURAL_KEYS.contains(&k.as_str()));
            for nested in map.values_mut() {
                strip_structural_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_structural_keys(item);
            }
        }
        _ => {}
    }
}

/// A unit of change exchanged between editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOperation {
    /// Unique id for idempotence checks.
    #[serde(default)]
    pub id: OperationId,
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Target element (empty for batches).
    #[serde(default, skip_serializing_if = "ElementId::is_empty")]
    pub element_id: ElementId,
    /// What changes.
    #[serde(default, skip_serializing_if = "ChangePayload::is_empty")]
    pub changes: ChangePayload,
    /// Nested operations of a batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<ChangeOperation>,
    /// Authoring time (ms since epoch).
    #[serde(default)]
    pub timestamp: u64,
    /// Where the operation was authored.
    #[serde(default)]
    pub origin: Origin,
}

impl ChangeOperation {
    /// Create an operation stamped with the current time.
    #[must_use]
    pub fn new(
        kind: OperationKind,
        element_id: impl Into<ElementId>,
        changes: ChangePayload,
        origin: Origin,
    ) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            element_id: element_id.into(),
            changes,
            updates: Vec::new(),
            timestamp: current_timestamp(),
            origin,
        }
    }

    /// Remote `updateElement` operation.
    #[must_use]
    pub fn update(element_id: impl Into<ElementId>, changes: ChangePayload) -> Self {
        Self::new(OperationKind::Update, element_id, changes, Origin::Remote)
    }

    /// Remote `createElement` operation.
    #[must_use]
    pub fn create(element_id: impl Into<ElementId>, changes: ChangePayload) -> Self {
        Self::new(OperationKind::Create, element_id, changes, Origin::Remote)
    }

    /// Remote `removeElement` operation.
    #[must_use]
    pub fn remove(element_id: impl Into<ElementId>) -> Self {
        Self::new(
            OperationKind::Remove,
            element_id,
            ChangePayload::default(),
            Origin::Remote,
        )
    }

    /// Remote `updateConnection` operation.
    #[must_use]
    pub fn connection_update(element_id: impl Into<ElementId>, waypoints: Vec<Point>) -> Self {
        Self::new(
            OperationKind::ConnectionUpdate,
            element_id,
            ChangePayload::waypoints(waypoints),
            Origin::Remote,
        )
    }

    /// Remote `batch_update` wrapping `updates`.
    #[must_use]
    pub fn batch(updates: Vec<Self>) -> Self {
        Self {
            updates,
            ..Self::new(
                OperationKind::Batch,
                ElementId::default(),
                ChangePayload::default(),
                Origin::Remote,
            )
        }
    }

    /// Set the origin, builder style.
    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Set the timestamp, builder style.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Leaf operations, with batches expanded depth-first.
    #[must_use]
    pub fn flatten(&self) -> Vec<&Self> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Self>) {
        if self.kind == OperationKind::Batch {
            for update in &self.updates {
                update.flatten_into(out);
            }
        } else {
            out.push(self);
        }
    }

    /// Serialize to wire JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_wire(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse wire JSON holding either one operation or an array of operations.
///
/// # Errors
///
/// Returns an error if the JSON does not match the wire format.
pub fn parse_wire(json: &str) -> SyncResult<Vec<ChangeOperation>> {
    let value: Value = serde_json::from_str(json)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Get the current Unix timestamp in milliseconds.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_update_element_from_wire() {
        let json = r#"{"type":"updateElement","elementId":"Task_1","changes":{"visual":{"x":300,"y":200}}}"#;
        let ops = parse_wire(json).expect("should parse");
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.element_id.as_str(), "Task_1");
        assert_eq!(op.origin, Origin::Remote);
        let visual = op.changes.visual.expect("visual");
        assert_eq!(visual.x, Some(300.0));
        assert_eq!(visual.width, None);
    }

    #[test]
    fn test_parse_batch_update() {
        let json = r#"{"type":"batch_update","updates":[
            {"type":"removeElement","elementId":"Task_2"},
            {"type":"updateConnection","elementId":"Flow_1","changes":{"waypoints":[{"x":1,"y":2}]}}
        ]}"#;
        let ops = parse_wire(json).expect("should parse");
        assert_eq!(ops[0].kind, OperationKind::Batch);
        let leaves = ops[0].flatten();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1].kind, OperationKind::ConnectionUpdate);
    }

    #[test]
    fn test_serialize_uses_wire_tags() {
        let op = ChangeOperation::remove("Task_1").with_origin(Origin::Local);
        let json: Value = serde_json::from_str(&op.to_wire().expect("serialize")).expect("json");
        assert_eq!(json["type"], "removeElement");
        assert_eq!(json["elementId"], "Task_1");
        assert_eq!(json["origin"], "local");
        assert!(json.get("changes").is_none());
    }

    #[test]
    fn test_operation_kind_tags_match_display() {
        for kind in OperationKind::ALL {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_merge_later_values_win() {
        let mut first = ChangePayload::attributes(
            json!({"name": "First", "documentation": "doc"})
                .as_object()
                .cloned()
                .expect("object"),
        );
        first.visual = Some(VisualChange::position(1.0, 2.0));

        let mut second =
            ChangePayload::attributes(json!({"name": "Second"}).as_object().cloned().expect("object"));
        second.visual = Some(VisualChange {
            x: Some(10.0),
            ..VisualChange::default()
        });

        first.merge(second);
        let attrs = first.business_object.expect("attrs");
        assert_eq!(attrs["name"], "Second");
        assert_eq!(attrs["documentation"], "doc");
        assert_eq!(first.visual, Some(VisualChange::position(10.0, 2.0)));
    }

    #[test]
    fn test_snapshot_strips_structural_keys_recursively() {
        let payload = ChangePayload {
            business_object: json!({"name": "A", "incoming": ["Flow_1"], "nested": {"parent": "x", "keep": 1}})
                .as_object()
                .cloned(),
            element: Some(ElementSpec {
                kind: ElementKind::Shape,
                type_tag: None,
                parent: Some("Lane_1".into()),
                source: None,
                target: None,
            }),
            ..ChangePayload::default()
        };
        let snapshot = payload.snapshot().expect("snapshot");
        assert!(snapshot["businessObject"].get("incoming").is_none());
        assert!(snapshot["businessObject"]["nested"].get("parent").is_none());
        assert_eq!(snapshot["businessObject"]["nested"]["keep"], 1);
        assert!(snapshot["element"].get("parent").is_none());
    }

    #[test]
    fn test_visual_threshold() {
        let a = VisualChange::position(100.0, 100.0);
        assert!(!a.differs_from(&VisualChange::position(100.9, 99.5), 1.0));
        assert!(a.differs_from(&VisualChange::position(101.5, 100.0), 1.0));
    }

    #[test]
    fn test_connection_payload_rounds_waypoints() {
        let flow = Element::connection(
            "Flow_1",
            "A".into(),
            "B".into(),
            vec![Point::new(10.4, 20.6)],
        );
        let payload = ChangePayload::from_element(&flow);
        assert_eq!(payload.waypoints, Some(vec![Point::new(10.0, 21.0)]));
        assert!(payload.visual.is_none());
    }
}
