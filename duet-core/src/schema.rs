//! Canonical serialized representation of a diagram document.
//!
//! Only declared links (parent, source, target) are stored; the reverse
//! links (children, incoming, outgoing) are rebuilt on load.

use serde::{Deserialize, Serialize};

use crate::{
    BusinessObject, Bounds, CoreError, CoreResult, Element, ElementId, ElementKind, MemoryHost,
    Point, SceneHost,
};

/// Document-friendly element description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDocument {
    /// Element identifier.
    pub id: ElementId,
    /// Structural role.
    pub kind: ElementKind,
    /// Semantic model object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_object: Option<BusinessObject>,
    /// Shape geometry.
    #[serde(default)]
    pub bounds: Bounds,
    /// Connection route.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waypoints: Vec<Point>,
    /// Declared parent (the root when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ElementId>,
    /// Connection source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ElementId>,
    /// Connection target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ElementId>,
}

impl From<&Element> for ElementDocument {
    fn from(element: &Element) -> Self {
        Self {
            id: element.id.clone(),
            kind: element.kind,
            business_object: element.business_object.clone(),
            bounds: element.bounds,
            waypoints: element.waypoints.clone(),
            parent: element.parent.clone(),
            source: element.source.clone(),
            target: element.target.clone(),
        }
    }
}

impl ElementDocument {
    /// Convert to a runtime element with empty reverse links.
    #[must_use]
    pub fn into_element(self) -> Element {
        Element {
            id: self.id,
            kind: self.kind,
            business_object: self.business_object,
            bounds: self.bounds,
            waypoints: self.waypoints,
            parent: self.parent,
            children: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            source: self.source,
            target: self.target,
        }
    }

    fn dependencies(&self) -> impl Iterator<Item = &ElementId> {
        [&self.parent, &self.source, &self.target]
            .into_iter()
            .flatten()
    }
}

/// A whole diagram, root excluded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagramDocument {
    /// Every non-root element.
    pub elements: Vec<ElementDocument>,
}

impl DiagramDocument {
    /// Snapshot every element of a host except its root.
    #[must_use]
    pub fn from_host<H: SceneHost + ?Sized>(host: &H) -> Self {
        let root = host.root_id().clone();
        let elements = host
            .element_ids()
            .iter()
            .filter(|id| **id != root)
            .filter_map(|id| host.get_element(id))
            .map(|element| {
                let mut doc = ElementDocument::from(element);
                if doc.parent.as_ref() == Some(&root) {
                    doc.parent = None;
                }
                doc
            })
            .collect();
        Self { elements }
    }

    /// Build an in-memory host from this document.
    ///
    /// Elements may appear in any order; each is inserted once everything it
    /// depends on is present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] naming the elements whose
    /// parent or endpoints never appear, or any insertion error.
    pub fn into_host(self) -> CoreResult<MemoryHost> {
        let mut host = MemoryHost::new();
        let mut pending = self.elements;

        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|doc| doc.dependencies().all(|dep| host.get_element(dep).is_some()));
            if ready.is_empty() {
                let names: Vec<String> = blocked.iter().map(|d| d.id.to_string()).collect();
                return Err(CoreError::InvalidOperation(format!(
                    "unresolved references for: {}",
                    names.join(", ")
                )));
            }
            for doc in ready {
                host.seed(doc.into_element())?;
            }
            pending = blocked;
        }
        Ok(host)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(CoreError::Serialization)
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(CoreError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "elements": [
            {"id": "Flow_1", "kind": "connection", "source": "Start_1", "target": "Task_1",
             "waypoints": [{"x": 36, "y": 18}, {"x": 100, "y": 40}]},
            {"id": "Task_1", "kind": "shape", "parent": "Lane_1",
             "bounds": {"x": 100, "y": 0, "width": 100, "height": 80},
             "businessObject": {"id": "Task_1", "$type": "bpmn:UserTask", "attrs": {"name": "Review"}}},
            {"id": "Lane_1", "kind": "shape", "bounds": {"x": 0, "y": 0, "width": 600, "height": 200}},
            {"id": "Start_1", "kind": "shape", "parent": "Lane_1"}
        ]
    }"#;

    #[test]
    fn test_load_resolves_out_of_order_elements() {
        let host = DiagramDocument::from_json(DOC)
            .expect("parse")
            .into_host()
            .expect("load");
        let lane = host.get_element(&"Lane_1".into()).expect("lane");
        assert_eq!(lane.children.len(), 2);
        let task = host.get_element(&"Task_1".into()).expect("task");
        assert_eq!(task.incoming, vec![ElementId::from("Flow_1")]);
        assert_eq!(
            task.business_object.as_ref().and_then(BusinessObject::name),
            Some("Review")
        );
    }

    #[test]
    fn test_load_reports_dangling_references() {
        let doc = DiagramDocument {
            elements: vec![ElementDocument {
                parent: Some("Missing".into()),
                ..ElementDocument::from(&Element::shape("Task_9", Bounds::default()))
            }],
        };
        let err = doc.into_host().expect_err("dangling parent");
        assert!(err.to_string().contains("Task_9"));
    }

    #[test]
    fn test_snapshot_omits_root_parent() {
        let host = DiagramDocument::from_json(DOC)
            .expect("parse")
            .into_host()
            .expect("load");
        let snapshot = DiagramDocument::from_host(&host);
        assert_eq!(snapshot.elements.len(), 4);
        let lane = snapshot
            .elements
            .iter()
            .find(|d| d.id.as_str() == "Lane_1")
            .expect("lane");
        assert!(lane.parent.is_none());
    }
}
