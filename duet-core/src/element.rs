//! Diagram elements - the entries of the document arena.
//!
//! Every structural link (parent, children, incoming, outgoing, source, target)
//! is an [`ElementId`] lookup into the arena, never an embedded reference.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for an element.
///
/// Diagram formats use human-readable ids such as `Task_1`, so the id is a
/// string rather than a UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    /// Create an element ID from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier with the given prefix (`Task` → `Task_1a2b3c4d`).
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}_{}", &uuid[..8]))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ElementId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The structural role of an element in the diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// The canvas root. Exactly one per document.
    Root,
    /// A node (task, event, gateway, pool...).
    Shape,
    /// An edge between two elements.
    Connection,
    /// A text label attached to another element.
    Label,
}

impl ElementKind {
    /// Default business object type tag used when a model object must be recreated.
    #[must_use]
    pub const fn default_type_tag(self) -> &'static str {
        match self {
            Self::Root => "bpmn:Process",
            Self::Shape => "bpmn:Task",
            Self::Connection => "bpmn:SequenceFlow",
            Self::Label => "bpmn:TextAnnotation",
        }
    }
}

/// A point in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

impl Point {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether both coordinates are finite numbers.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Round both coordinates to integer precision.
    #[must_use]
    pub fn rounded(self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
        }
    }
}

/// Position and size of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 80.0,
        }
    }
}

impl Bounds {
    /// Create bounds.
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether every component is a finite number.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// The semantic (business) model object behind a diagram element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessObject {
    /// Semantic identifier. Usually equal to the element id.
    pub id: String,
    /// Type tag of the owning document format (`bpmn:Task`).
    #[serde(rename = "$type")]
    pub type_tag: String,
    /// Free-form attributes (`name`, `documentation`, ...).
    #[serde(default)]
    pub attrs: Map<String, Value>,
}

impl BusinessObject {
    /// Create a business object with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_tag: type_tag.into(),
            attrs: Map::new(),
        }
    }

    /// Set an attribute, builder style.
    #[must_use]
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// The `name` attribute, if set to a string.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.attrs.get("name").and_then(Value::as_str)
    }

    /// Flatten into a single attribute map, including `id` and `$type`.
    #[must_use]
    pub fn to_attr_map(&self) -> Map<String, Value> {
        let mut map = self.attrs.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("$type".to_string(), Value::String(self.type_tag.clone()));
        map
    }
}

/// A diagram element stored in the host arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Unique identifier.
    pub id: ElementId,
    /// Structural role.
    pub kind: ElementKind,
    /// Semantic model object, if any.
    pub business_object: Option<BusinessObject>,
    /// Geometry (meaningful for shapes and labels).
    pub bounds: Bounds,
    /// Route of a connection.
    pub waypoints: Vec<Point>,
    /// Containing element.
    pub parent: Option<ElementId>,
    /// Contained elements.
    pub children: Vec<ElementId>,
    /// Connections ending at this element.
    pub incoming: Vec<ElementId>,
    /// Connections starting at this element.
    pub outgoing: Vec<ElementId>,
    /// Connection source.
    pub source: Option<ElementId>,
    /// Connection target.
    pub target: Option<ElementId>,
}

impl Element {
    fn bare(id: ElementId, kind: ElementKind) -> Self {
        let business_object = match kind {
            ElementKind::Root => None,
            _ => Some(BusinessObject::new(id.as_str(), kind.default_type_tag())),
        };
        Self {
            id,
            kind,
            business_object,
            bounds: Bounds::default(),
            waypoints: Vec::new(),
            parent: None,
            children: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            source: None,
            target: None,
        }
    }

    /// Create the canvas root element.
    #[must_use]
    pub fn root(id: impl Into<ElementId>) -> Self {
        Self::bare(id.into(), ElementKind::Root)
    }

    /// Create a shape with the given bounds.
    #[must_use]
    pub fn shape(id: impl Into<ElementId>, bounds: Bounds) -> Self {
        let mut element = Self::bare(id.into(), ElementKind::Shape);
        element.bounds = bounds;
        element
    }

    /// Create a connection between two elements.
    #[must_use]
    pub fn connection(
        id: impl Into<ElementId>,
        source: ElementId,
        target: ElementId,
        waypoints: Vec<Point>,
    ) -> Self {
        let mut element = Self::bare(id.into(), ElementKind::Connection);
        element.source = Some(source);
        element.target = Some(target);
        element.waypoints = waypoints;
        element
    }

    /// Replace the business object, builder style.
    #[must_use]
    pub fn with_business_object(mut self, business_object: BusinessObject) -> Self {
        self.business_object = Some(business_object);
        self
    }

    /// Set the declared parent, builder style.
    #[must_use]
    pub fn with_parent(mut self, parent: ElementId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Whether this element is a connection.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.kind == ElementKind::Connection
    }

    /// Whether this element is the canvas root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.kind == ElementKind::Root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = ElementId::generate("Task");
        let b = ElementId::generate("Task");
        assert!(a.as_str().starts_with("Task_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_shape_gets_default_business_object() {
        let shape = Element::shape("Task_1", Bounds::new(10.0, 20.0, 100.0, 80.0));
        let bo = shape.business_object.expect("shape has a model object");
        assert_eq!(bo.id, "Task_1");
        assert_eq!(bo.type_tag, "bpmn:Task");
    }

    #[test]
    fn test_root_has_no_business_object() {
        assert!(Element::root("__root").business_object.is_none());
    }

    #[test]
    fn test_business_object_attr_map_includes_identity() {
        let bo = BusinessObject::new("Task_1", "bpmn:Task").with_attr("name", "Review");
        let map = bo.to_attr_map();
        assert_eq!(map["id"], "Task_1");
        assert_eq!(map["$type"], "bpmn:Task");
        assert_eq!(map["name"], "Review");
        assert_eq!(bo.name(), Some("Review"));
    }

    #[test]
    fn test_point_rounding_and_finiteness() {
        let p = Point::new(10.4, 19.6).rounded();
        assert_eq!(p, Point::new(10.0, 20.0));
        assert!(!Point::new(f64::NAN, 1.0).is_finite());
        assert!(!Bounds::new(0.0, f64::INFINITY, 1.0, 1.0).is_finite());
    }
}
