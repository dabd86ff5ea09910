//! The scene graph host contract.
//!
//! The synchronization layer never owns elements or graphics; it reaches them
//! through this trait. [`crate::MemoryHost`] is the in-process implementation.

use serde_json::{Map, Value};

use crate::{
    BusinessObject, CoreResult, Element, ElementId, Emission, EventBus, HostEvent, RenderHandle,
};

/// Operations the synchronization core consumes from the scene graph host.
///
/// Methods on this trait are "raw": they never emit change events. The
/// event-emitting modeling API lives in [`crate::modeling`] and is built on top.
pub trait SceneHost {
    /// ID of the canvas root element.
    fn root_id(&self) -> &ElementId;

    /// Look up an element.
    fn get_element(&self, id: &ElementId) -> Option<&Element>;

    /// Look up an element for direct mutation.
    fn get_element_mut(&mut self, id: &ElementId) -> Option<&mut Element>;

    /// IDs of every element, in a stable order.
    fn element_ids(&self) -> Vec<ElementId>;

    /// Put an element into the arena without creating graphics.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::DuplicateElement`] if the id is taken.
    fn insert_element(&mut self, element: Element) -> CoreResult<()>;

    /// Remove an element from the arena. Links held by other elements are untouched.
    fn take_element(&mut self, id: &ElementId) -> Option<Element>;

    /// Current render handle of an element.
    fn render_handle(&self, id: &ElementId) -> Option<&RenderHandle>;

    /// Create (or replace) the render handle of an element. The new handle is detached.
    ///
    /// # Errors
    ///
    /// Returns an error if the element does not exist.
    fn create_render_handle(&mut self, id: &ElementId) -> CoreResult<RenderHandle>;

    /// Redraw an element's graphics from its current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the element or its handle is missing, or the render
    /// layer rejects the update.
    fn update_render_handle(&mut self, id: &ElementId) -> CoreResult<()>;

    /// Drop an element's graphics.
    fn remove_render_handle(&mut self, id: &ElementId) -> Option<RenderHandle>;

    /// Link an element under a parent and attach its graphics to the live tree.
    ///
    /// # Errors
    ///
    /// Returns an error if either element is missing.
    fn attach_element(&mut self, id: &ElementId, parent: &ElementId) -> CoreResult<()>;

    /// Unlink an element from its parent's children and detach its graphics.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is missing.
    fn detach_element(&mut self, id: &ElementId) -> CoreResult<()>;

    /// Stop redrawing until [`SceneHost::resume_rendering`]. Calls nest.
    fn suspend_rendering(&mut self);

    /// Undo one [`SceneHost::suspend_rendering`].
    fn resume_rendering(&mut self);

    /// Redraw the whole render tree now.
    fn force_redraw(&mut self);

    /// Whether rendering is currently suspended.
    fn is_rendering_suspended(&self) -> bool;

    /// Construct a model object for the owning document format.
    fn create_model_object(&mut self, type_tag: &str, attrs: Map<String, Value>) -> BusinessObject;

    /// The event channel.
    fn events(&self) -> &EventBus;

    /// The event channel, mutably.
    fn events_mut(&mut self) -> &mut EventBus;

    /// Host clock in milliseconds, used to stamp events.
    fn now(&self) -> u64;

    /// Move the host clock; events emitted afterwards carry `now`.
    fn set_now(&mut self, now: u64);

    /// Emit an event through the single emission entry point.
    fn emit(&mut self, event: HostEvent) -> Emission {
        self.events_mut().emit(event)
    }

    /// Emit events the host deferred to the next turn. Returns how many were emitted.
    fn flush_deferred(&mut self) -> usize {
        0
    }
}
