//! Silent application of mutations.
//!
//! The applier writes straight into the host's element arena and then asks
//! the host to redraw the element's graphics. It never goes through the
//! event-emitting modeling API, so nothing it does is reported as a change
//! by the host itself (render-internal notifications aside).

use duet_core::{modeling, Bounds, Element, ElementId, ElementKind, Point, SceneHost};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::operation::{ChangePayload, VisualChange};
use crate::{SyncError, SyncResult};

/// Attribute keys that are never written from a payload.
pub const READ_ONLY_KEYS: &[&str] = &[
    "id",
    "$type",
    "$parent",
    "parent",
    "children",
    "incoming",
    "outgoing",
    "sourceRef",
    "targetRef",
];

/// One entry of [`SilentMutationApplier::batch_apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum SilentUpdate {
    /// Write business attributes.
    Attributes(ElementId, Map<String, Value>),
    /// Write geometry.
    Geometry(ElementId, VisualChange),
    /// Replace a connection route.
    Waypoints(ElementId, Vec<Point>),
    /// Write a full change payload.
    Changes(ElementId, ChangePayload),
}

impl SilentUpdate {
    /// Target element.
    #[must_use]
    pub fn element_id(&self) -> &ElementId {
        match self {
            Self::Attributes(id, _)
            | Self::Geometry(id, _)
            | Self::Waypoints(id, _)
            | Self::Changes(id, _) => id,
        }
    }
}

/// Result of [`SilentMutationApplier::batch_apply`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Updates written.
    pub applied: usize,
    /// Updates skipped because their element was missing.
    pub skipped: usize,
    /// Updates that failed, in batch order.
    pub failures: Vec<(ElementId, SyncError)>,
}

/// Applier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplierStats {
    /// Mutations written.
    pub applied: u64,
    /// Mutations skipped for a missing element.
    pub missing: u64,
    /// Non-finite values replaced by the last known value.
    pub sanitized: u64,
    /// Read-only attribute writes refused.
    pub rejected_keys: u64,
    /// Batches applied.
    pub batches: u64,
}

/// Writes mutations into the host without change events.
#[derive(Debug, Default)]
pub struct SilentMutationApplier {
    stats: ApplierStats,
}

impl SilentMutationApplier {
    /// Create an applier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write business attributes. A `null` value removes the attribute.
    ///
    /// Returns `Ok(false)` (after logging) when the element does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the element has no model object or the render
    /// update fails.
    pub fn update_model_attributes<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        attrs: &Map<String, Value>,
    ) -> SyncResult<bool> {
        if !self.exists(host, element_id) {
            return Ok(false);
        }
        self.write_attributes(host, element_id, attrs)?;
        self.redraw(host, element_id)?;
        Ok(true)
    }

    /// Write geometry. Non-finite values keep the current value.
    ///
    /// Returns `Ok(false)` (after logging) when the element does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the render update fails.
    pub fn update_geometry<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        geometry: &VisualChange,
    ) -> SyncResult<bool> {
        if !self.exists(host, element_id) {
            return Ok(false);
        }
        self.write_geometry(host, element_id, geometry);
        self.redraw(host, element_id)?;
        Ok(true)
    }

    /// Replace a connection's route, dropping non-finite points.
    ///
    /// Returns `Ok(false)` (after logging) when the element does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPayload`] if the element is not a
    /// connection or no finite point remains, or an error if the render
    /// update fails.
    pub fn update_waypoints<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        waypoints: &[Point],
    ) -> SyncResult<bool> {
        if !self.exists(host, element_id) {
            return Ok(false);
        }
        self.write_waypoints(host, element_id, waypoints)?;
        self.redraw(host, element_id)?;
        Ok(true)
    }

    /// Write every part of a payload with a single render update.
    ///
    /// Returns `Ok(false)` (after logging) when the element does not exist.
    ///
    /// # Errors
    ///
    /// See [`Self::update_model_attributes`] and [`Self::update_waypoints`].
    pub fn apply_changes<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        changes: &ChangePayload,
    ) -> SyncResult<bool> {
        if !self.exists(host, element_id) {
            return Ok(false);
        }
        // Nothing is written unless every part can be.
        if changes.business_object.is_some()
            && host
                .get_element(element_id)
                .is_some_and(|e| e.business_object.is_none())
        {
            return Err(SyncError::InvalidPayload(format!(
                "{element_id} has no model object"
            )));
        }
        let waypoints = match &changes.waypoints {
            Some(points) => Some(checked_waypoints(host, element_id, points)?),
            None => None,
        };

        if let Some(attrs) = &changes.business_object {
            self.write_attributes(host, element_id, attrs)?;
        }
        if let Some(visual) = &changes.visual {
            self.write_geometry(host, element_id, visual);
        }
        if let (Some(valid), Some(points)) = (waypoints, &changes.waypoints) {
            self.store_waypoints(host, element_id, valid, points.len());
        }
        self.redraw(host, element_id)?;
        Ok(true)
    }

    /// Construct an element from a create payload.
    ///
    /// An element that already exists is updated in place instead, so
    /// applying the same create twice leaves one element.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPayload`] when the payload has no element
    /// descriptor, [`SyncError::ElementNotFound`] when the parent or a
    /// connection endpoint is missing, or a host error.
    pub fn create_element<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        changes: &ChangePayload,
    ) -> SyncResult<()> {
        if host.get_element(element_id).is_some() {
            tracing::debug!(element_id = %element_id, "create for existing element applied as update");
            self.apply_changes(host, element_id, changes)?;
            return Ok(());
        }
        let spec = changes.element.as_ref().ok_or_else(|| {
            SyncError::InvalidPayload(format!("create for {element_id} has no element descriptor"))
        })?;
        if spec.kind == ElementKind::Root {
            return Err(SyncError::InvalidPayload("a second root cannot be created".into()));
        }

        let parent = spec
            .parent
            .clone()
            .unwrap_or_else(|| host.root_id().clone());
        if host.get_element(&parent).is_none() {
            return Err(SyncError::ElementNotFound(parent.to_string()));
        }

        let mut attrs = changes.business_object.clone().unwrap_or_default();
        attrs.retain(|k, _| k == "id" || !READ_ONLY_KEYS.contains(&k.as_str()));
        attrs
            .entry("id")
            .or_insert_with(|| Value::String(element_id.to_string()));
        let type_tag = spec
            .type_tag
            .clone()
            .unwrap_or_else(|| spec.kind.default_type_tag().to_string());
        let business_object = host.create_model_object(&type_tag, attrs);

        let mut element = match spec.kind {
            ElementKind::Connection => {
                let (Some(source), Some(target)) = (&spec.source, &spec.target) else {
                    return Err(SyncError::InvalidPayload(format!(
                        "connection {element_id} needs a source and a target"
                    )));
                };
                for endpoint in [source, target] {
                    if host.get_element(endpoint).is_none() {
                        return Err(SyncError::ElementNotFound(endpoint.to_string()));
                    }
                }
                let waypoints = changes
                    .waypoints
                    .as_deref()
                    .map(finite_points)
                    .unwrap_or_default();
                Element::connection(element_id.clone(), source.clone(), target.clone(), waypoints)
            }
            _ => {
                let bounds = changes
                    .visual
                    .map_or_else(Bounds::default, |v| sanitize(&v, Bounds::default()).0);
                let mut element = Element::shape(element_id.clone(), bounds);
                element.kind = spec.kind;
                element
            }
        };
        element.business_object = Some(business_object);

        modeling::insert_silently(host, element, Some(&parent))?;
        self.stats.applied += 1;
        tracing::debug!(element_id = %element_id, kind = ?spec.kind, "element created silently");
        Ok(())
    }

    /// Remove an element with everything depending on it.
    ///
    /// Returns the removed ids, or `Ok(vec![])` when the element was already gone.
    ///
    /// # Errors
    ///
    /// Returns a host error, e.g. when asked to remove the root.
    pub fn remove_element<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
    ) -> SyncResult<Vec<ElementId>> {
        if host.get_element(element_id).is_none() {
            tracing::debug!(element_id = %element_id, "remove for missing element skipped");
            self.stats.missing += 1;
            return Ok(Vec::new());
        }
        let removed = modeling::remove_silently(host, element_id)?;
        self.stats.applied += 1;
        Ok(removed.into_iter().map(|e| e.id).collect())
    }

    /// Apply several updates with rendering suspended and a single redraw.
    ///
    /// Failures are collected and do not stop the batch; nothing is rolled back.
    pub fn batch_apply<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        updates: &[SilentUpdate],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        host.suspend_rendering();
        for update in updates {
            let result = match update {
                SilentUpdate::Attributes(id, attrs) => {
                    self.update_model_attributes(host, id, attrs)
                }
                SilentUpdate::Geometry(id, visual) => self.update_geometry(host, id, visual),
                SilentUpdate::Waypoints(id, points) => self.update_waypoints(host, id, points),
                SilentUpdate::Changes(id, changes) => self.apply_changes(host, id, changes),
            };
            match result {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    tracing::warn!(element_id = %update.element_id(), error = %e, "batch update failed");
                    outcome.failures.push((update.element_id().clone(), e));
                }
            }
        }
        host.force_redraw();
        host.resume_rendering();
        self.stats.batches += 1;
        outcome
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ApplierStats {
        self.stats
    }

    fn exists<H: SceneHost + ?Sized>(&mut self, host: &H, element_id: &ElementId) -> bool {
        if host.get_element(element_id).is_some() {
            return true;
        }
        tracing::warn!(element_id = %element_id, "silent update skipped: element not found");
        self.stats.missing += 1;
        false
    }

    fn redraw<H: SceneHost + ?Sized>(&mut self, host: &mut H, element_id: &ElementId) -> SyncResult<()> {
        host.update_render_handle(element_id)?;
        self.stats.applied += 1;
        Ok(())
    }

    fn write_attributes<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        attrs: &Map<String, Value>,
    ) -> SyncResult<()> {
        let business_object = host
            .get_element_mut(element_id)
            .and_then(|e| e.business_object.as_mut())
            .ok_or_else(|| {
                SyncError::InvalidPayload(format!("{element_id} has no model object"))
            })?;

        let mut rejected = 0;
        for (key, value) in attrs {
            if READ_ONLY_KEYS.contains(&key.as_str()) {
                let unchanged = match key.as_str() {
                    "id" => value.as_str() == Some(business_object.id.as_str()),
                    "$type" => value.as_str() == Some(business_object.type_tag.as_str()),
                    _ => false,
                };
                if !unchanged {
                    let rejection = SyncError::WriteRejected {
                        element_id: element_id.to_string(),
                        property: key.clone(),
                    };
                    tracing::warn!("{rejection}");
                    rejected += 1;
                }
                continue;
            }
            if value.is_null() {
                business_object.attrs.remove(key);
            } else {
                business_object.attrs.insert(key.clone(), value.clone());
            }
        }
        self.stats.rejected_keys += rejected;
        Ok(())
    }

    fn write_geometry<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        geometry: &VisualChange,
    ) {
        let Some(element) = host.get_element_mut(element_id) else {
            return;
        };
        let (bounds, replaced) = sanitize(geometry, element.bounds);
        element.bounds = bounds;
        if replaced > 0 {
            tracing::warn!(
                element_id = %element_id,
                replaced,
                "non-finite geometry replaced with last known values"
            );
            self.stats.sanitized += replaced;
        }
    }

    fn write_waypoints<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        waypoints: &[Point],
    ) -> SyncResult<()> {
        let valid = checked_waypoints(host, element_id, waypoints)?;
        self.store_waypoints(host, element_id, valid, waypoints.len());
        Ok(())
    }

    fn store_waypoints<H: SceneHost + ?Sized>(
        &mut self,
        host: &mut H,
        element_id: &ElementId,
        valid: Vec<Point>,
        received: usize,
    ) {
        let dropped = received - valid.len();
        if let Some(element) = host.get_element_mut(element_id) {
            element.waypoints = valid;
        }
        if dropped > 0 {
            tracing::warn!(element_id = %element_id, dropped, "non-finite waypoints dropped");
            self.stats.sanitized += dropped as u64;
        }
    }
}

/// The finite points of a route for `element_id`, which must be a connection.
fn checked_waypoints<H: SceneHost + ?Sized>(
    host: &H,
    element_id: &ElementId,
    waypoints: &[Point],
) -> SyncResult<Vec<Point>> {
    let element = host
        .get_element(element_id)
        .ok_or_else(|| SyncError::ElementNotFound(element_id.to_string()))?;
    if !element.is_connection() {
        return Err(SyncError::InvalidPayload(format!(
            "{element_id} is not a connection"
        )));
    }
    let valid = finite_points(waypoints);
    if valid.is_empty() {
        return Err(SyncError::InvalidPayload(format!(
            "no finite waypoint for {element_id}"
        )));
    }
    Ok(valid)
}

/// Keep only points with finite coordinates.
#[must_use]
pub fn finite_points(points: &[Point]) -> Vec<Point> {
    points.iter().copied().filter(Point::is_finite).collect()
}

/// Apply a geometry change, keeping `current` for every non-finite field.
/// Returns the new bounds and how many fields were replaced.
fn sanitize(change: &VisualChange, current: Bounds) -> (Bounds, u64) {
    let mut replaced = 0;
    let mut pick = |value: Option<f64>, fallback: f64| match value {
        Some(v) if v.is_finite() => v,
        Some(_) => {
            replaced += 1;
            fallback
        }
        None => fallback,
    };
    let bounds = Bounds {
        x: pick(change.x, current.x),
        y: pick(change.y, current.y),
        width: pick(change.width, current.width),
        height: pick(change.height, current.height),
    };
    (bounds, replaced)
}
