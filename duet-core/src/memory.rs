//! In-memory scene graph host.
//!
//! Keeps elements in an arena keyed by id, tracks render handles separately,
//! and counts render activity so callers can observe redraw cost.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::{
    BusinessObject, CoreError, CoreResult, Element, ElementId, EventBus, EventType, HostEvent,
    RenderHandle, RenderKind, RenderStats, SceneHost,
};

/// Default id of the canvas root.
pub const ROOT_ID: &str = "__root";

/// Arena-backed [`SceneHost`].
#[derive(Debug)]
pub struct MemoryHost {
    elements: BTreeMap<ElementId, Element>,
    handles: HashMap<ElementId, RenderHandle>,
    root: ElementId,
    next_handle: u64,
    suspend_depth: u32,
    dirty_while_suspended: bool,
    stats: RenderStats,
    events: EventBus,
    deferred: Vec<HostEvent>,
    clock: u64,
    failing_updates: u32,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Create a host containing only the canvas root.
    #[must_use]
    pub fn new() -> Self {
        let root = ElementId::from(ROOT_ID);
        let mut elements = BTreeMap::new();
        elements.insert(root.clone(), Element::root(root.clone()));
        let mut handles = HashMap::new();
        handles.insert(
            root.clone(),
            RenderHandle {
                handle_id: 0,
                kind: RenderKind::Shape,
                attached: true,
                revision: 0,
            },
        );
        Self {
            elements,
            handles,
            root,
            next_handle: 1,
            suspend_depth: 0,
            dirty_while_suspended: false,
            stats: RenderStats::default(),
            events: EventBus::new(),
            deferred: Vec::new(),
            clock: 0,
            failing_updates: 0,
        }
    }

    /// Render activity counters.
    #[must_use]
    pub fn render_stats(&self) -> RenderStats {
        self.stats
    }

    /// Reset render activity counters.
    pub fn reset_render_stats(&mut self) {
        self.stats = RenderStats::default();
    }

    /// Number of elements, root included.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Number of events waiting for [`SceneHost::flush_deferred`].
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Make the next `count` render handle updates fail.
    pub fn fail_next_render_updates(&mut self, count: u32) {
        self.failing_updates = count;
    }

    /// Add an element with graphics attached under its declared parent (or the root).
    ///
    /// Connection endpoints get their `incoming`/`outgoing` lists updated. No
    /// events are emitted; use this to seed a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the parent does not exist.
    pub fn seed(&mut self, element: Element) -> CoreResult<ElementId> {
        let id = element.id.clone();
        let parent = element.parent.clone().unwrap_or_else(|| self.root.clone());
        let (source, target) = (element.source.clone(), element.target.clone());
        self.insert_element(element)?;
        if let Some(source) = source {
            if let Some(source) = self.elements.get_mut(&source) {
                source.outgoing.push(id.clone());
            }
        }
        if let Some(target) = target {
            if let Some(target) = self.elements.get_mut(&target) {
                target.incoming.push(id.clone());
            }
        }
        self.create_render_handle(&id)?;
        self.attach_element(&id, &parent)?;
        Ok(id)
    }

    /// Drop an element's graphics without telling anyone (simulates drift).
    pub fn drop_render_handle(&mut self, id: &ElementId) -> bool {
        self.handles.remove(id).is_some()
    }

    /// Mark an element's graphics as detached without unlinking it (simulates drift).
    pub fn disconnect_render_handle(&mut self, id: &ElementId) -> bool {
        match self.handles.get_mut(id) {
            Some(handle) => {
                handle.attached = false;
                true
            }
            None => false,
        }
    }

    fn defer(&mut self, event: HostEvent) {
        self.deferred.push(event);
    }
}

impl SceneHost for MemoryHost {
    fn root_id(&self) -> &ElementId {
        &self.root
    }

    fn get_element(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    fn get_element_mut(&mut self, id: &ElementId) -> Option<&mut Element> {
        self.elements.get_mut(id)
    }

    fn element_ids(&self) -> Vec<ElementId> {
        self.elements.keys().cloned().collect()
    }

    fn insert_element(&mut self, element: Element) -> CoreResult<()> {
        if self.elements.contains_key(&element.id) {
            return Err(CoreError::DuplicateElement(element.id.to_string()));
        }
        self.elements.insert(element.id.clone(), element);
        Ok(())
    }

    fn take_element(&mut self, id: &ElementId) -> Option<Element> {
        if *id == self.root {
            return None;
        }
        self.elements.remove(id)
    }

    fn render_handle(&self, id: &ElementId) -> Option<&RenderHandle> {
        self.handles.get(id)
    }

    fn create_render_handle(&mut self, id: &ElementId) -> CoreResult<RenderHandle> {
        let element = self
            .elements
            .get(id)
            .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?;
        let handle = RenderHandle {
            handle_id: self.next_handle,
            kind: RenderKind::for_element(element.kind),
            attached: false,
            revision: 0,
        };
        self.next_handle += 1;
        self.handles.insert(id.clone(), handle);
        self.stats.handles_created += 1;
        Ok(handle)
    }

    fn update_render_handle(&mut self, id: &ElementId) -> CoreResult<()> {
        if self.failing_updates > 0 {
            self.failing_updates -= 1;
            return Err(CoreError::Render(format!("render update rejected for {id}")));
        }
        if !self.elements.contains_key(id) {
            return Err(CoreError::ElementNotFound(id.to_string()));
        }
        let handle = self
            .handles
            .get_mut(id)
            .ok_or_else(|| CoreError::Render(format!("no render handle for {id}")))?;
        handle.revision += 1;
        self.stats.handle_updates += 1;
        if self.suspend_depth > 0 {
            self.stats.deferred_updates += 1;
            self.dirty_while_suspended = true;
        }
        // Graphics updates notify listeners on the next turn, like a real canvas.
        let event = HostEvent::for_element(EventType::ElementChanged, id.clone(), self.clock);
        self.defer(event);
        Ok(())
    }

    fn remove_render_handle(&mut self, id: &ElementId) -> Option<RenderHandle> {
        self.handles.remove(id)
    }

    fn attach_element(&mut self, id: &ElementId, parent: &ElementId) -> CoreResult<()> {
        if !self.elements.contains_key(parent) {
            return Err(CoreError::ElementNotFound(parent.to_string()));
        }
        let element = self
            .elements
            .get_mut(id)
            .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?;
        let previous = element.parent.replace(parent.clone());
        if let Some(previous) = previous.filter(|p| p != parent) {
            if let Some(old_parent) = self.elements.get_mut(&previous) {
                old_parent.children.retain(|c| c != id);
            }
        }
        if let Some(parent_element) = self.elements.get_mut(parent) {
            if !parent_element.children.contains(id) {
                parent_element.children.push(id.clone());
            }
        }
        if let Some(handle) = self.handles.get_mut(id) {
            handle.attached = true;
        }
        Ok(())
    }

    fn detach_element(&mut self, id: &ElementId) -> CoreResult<()> {
        let parent = self
            .elements
            .get(id)
            .ok_or_else(|| CoreError::ElementNotFound(id.to_string()))?
            .parent
            .clone();
        if let Some(parent) = parent {
            if let Some(parent_element) = self.elements.get_mut(&parent) {
                parent_element.children.retain(|c| c != id);
            }
        }
        if let Some(handle) = self.handles.get_mut(id) {
            handle.attached = false;
        }
        Ok(())
    }

    fn suspend_rendering(&mut self) {
        self.suspend_depth += 1;
    }

    fn resume_rendering(&mut self) {
        if self.suspend_depth == 0 {
            tracing::debug!("resume_rendering called while not suspended");
            return;
        }
        self.suspend_depth -= 1;
        if self.suspend_depth == 0 && self.dirty_while_suspended {
            self.dirty_while_suspended = false;
            self.force_redraw();
        }
    }

    fn force_redraw(&mut self) {
        if self.suspend_depth > 0 {
            self.dirty_while_suspended = true;
            return;
        }
        self.stats.redraws += 1;
        let event = HostEvent::global(EventType::CanvasRedrawn, self.clock);
        self.events.emit(event);
    }

    fn is_rendering_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    fn create_model_object(&mut self, type_tag: &str, attrs: Map<String, Value>) -> BusinessObject {
        let id = attrs
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| ElementId::generate("Element").to_string(), str::to_string);
        let mut business_object = BusinessObject::new(id, type_tag);
        business_object.attrs = attrs
            .into_iter()
            .filter(|(k, _)| k != "id" && k != "$type")
            .collect();
        business_object
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    fn now(&self) -> u64 {
        self.clock
    }

    fn set_now(&mut self, now: u64) {
        self.clock = now;
    }

    fn flush_deferred(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for event in deferred {
            self.events.emit(event);
        }
        count
    }
}
