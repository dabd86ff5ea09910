//! Command histories.
//!
//! Two disjoint histories are kept. The user history records commands for
//! undo/redo and announces every change with a `commandStack.changed` event.
//! The collaboration history executes commands without recording anything,
//! so remote edits can never be undone locally.

use std::ops::{Deref, DerefMut};

use duet_core::{
    modeling, Bounds, Element, ElementId, EventSource, EventType, HostEvent, SceneHost,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SyncResult;

/// A reversible edit.
///
/// `source` is the tag attached to every event the command makes the host
/// emit: [`EventSource::Command`] for user edits and
/// [`EventSource::Collaboration`] for collaborative ones.
pub trait Command<H: SceneHost + ?Sized> {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Perform the edit.
    ///
    /// # Errors
    ///
    /// Returns an error if the host rejects the edit.
    fn execute(&mut self, host: &mut H, source: EventSource) -> SyncResult<()>;

    /// Undo a previous [`Command::execute`].
    ///
    /// # Errors
    ///
    /// Returns an error if the host rejects the edit.
    fn revert(&mut self, host: &mut H, source: EventSource) -> SyncResult<()>;
}

/// Move a shape by a delta.
#[derive(Debug, Clone)]
pub struct MoveShapeCommand {
    element_id: ElementId,
    dx: f64,
    dy: f64,
}

impl MoveShapeCommand {
    /// Create a move of `element_id` by (`dx`, `dy`).
    #[must_use]
    pub fn new(element_id: impl Into<ElementId>, dx: f64, dy: f64) -> Self {
        Self {
            element_id: element_id.into(),
            dx,
            dy,
        }
    }
}

impl<H: SceneHost + ?Sized> Command<H> for MoveShapeCommand {
    fn name(&self) -> &'static str {
        "shape.move"
    }

    fn execute(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        modeling::move_shape(host, &self.element_id, self.dx, self.dy, source)?;
        Ok(())
    }

    fn revert(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        modeling::move_shape(host, &self.element_id, -self.dx, -self.dy, source)?;
        Ok(())
    }
}

/// Set business attributes, remembering the previous values.
#[derive(Debug, Clone)]
pub struct UpdatePropertiesCommand {
    element_id: ElementId,
    attrs: Map<String, Value>,
    previous: Option<Map<String, Value>>,
}

impl UpdatePropertiesCommand {
    /// Create an attribute update. `null` values remove attributes.
    #[must_use]
    pub fn new(element_id: impl Into<ElementId>, attrs: Map<String, Value>) -> Self {
        Self {
            element_id: element_id.into(),
            attrs,
            previous: None,
        }
    }
}

impl<H: SceneHost + ?Sized> Command<H> for UpdatePropertiesCommand {
    fn name(&self) -> &'static str {
        "element.updateProperties"
    }

    fn execute(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        let previous = modeling::update_properties(host, &self.element_id, &self.attrs, source)?;
        self.previous = Some(previous);
        Ok(())
    }

    fn revert(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        if let Some(previous) = self.previous.take() {
            modeling::update_properties(host, &self.element_id, &previous, source)?;
        }
        Ok(())
    }
}

/// Add a shape or connection.
#[derive(Debug, Clone)]
pub struct CreateElementCommand {
    element: Element,
    parent: Option<ElementId>,
}

impl CreateElementCommand {
    /// Create a shape at `bounds` under the root.
    #[must_use]
    pub fn shape(element_id: impl Into<ElementId>, bounds: Bounds) -> Self {
        Self::new(Element::shape(element_id, bounds), None)
    }

    /// Create any element under `parent` (the root when `None`).
    #[must_use]
    pub fn new(element: Element, parent: Option<ElementId>) -> Self {
        Self { element, parent }
    }
}

impl<H: SceneHost + ?Sized> Command<H> for CreateElementCommand {
    fn name(&self) -> &'static str {
        "element.create"
    }

    fn execute(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        modeling::add_element(host, self.element.clone(), self.parent.as_ref(), source)?;
        Ok(())
    }

    fn revert(&mut self, host: &mut H, source: EventSource) -> SyncResult<()> {
        modeling::remove_element(host, &self.element.id, source)?;
        Ok(())
    }
}

/// Undo-capable command stack.
pub struct CommandStack<H: SceneHost + ?Sized> {
    undo: Vec<Box<dyn Command<H>>>,
    redo: Vec<Box<dyn Command<H>>>,
    recording: bool,
}

impl<H: SceneHost + ?Sized> Default for CommandStack<H> {
    fn default() -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            recording: true,
        }
    }
}

impl<H: SceneHost + ?Sized> CommandStack<H> {
    /// A stack that executes commands but never records them.
    #[must_use]
    pub fn non_recording() -> Self {
        Self {
            recording: false,
            ..Self::default()
        }
    }

    /// Execute `command` tagged with `source`, recording it if enabled.
    fn run(&mut self, mut command: Box<dyn Command<H>>, host: &mut H, source: EventSource) -> SyncResult<()> {
        command.execute(host, source)?;
        if self.recording {
            self.undo.push(command);
            self.redo.clear();
        }
        Ok(())
    }

    /// Number of undoable commands.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Number of redoable commands.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    /// Whether executed commands are recorded.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

/// Undo/redo availability of the user history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRedoStatus {
    /// Whether undo is available.
    pub can_undo: bool,
    /// Whether redo is available.
    pub can_redo: bool,
    /// Undo stack depth.
    pub undo_depth: usize,
    /// Redo stack depth.
    pub redo_depth: usize,
    /// Whether the user history records.
    pub recording: bool,
    /// Whether a collaborative command is executing.
    pub collaboration_mode: bool,
}

/// Counters of the collaboration history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationStats {
    /// Collaborative commands executed successfully.
    pub executed: u64,
    /// Collaborative commands that failed.
    pub failed: u64,
    /// Length of the collaboration history; it never records, so zero.
    pub history_len: usize,
    /// Always false.
    pub can_undo: bool,
    /// Always false.
    pub can_redo: bool,
}

/// Owns the user and collaboration histories.
pub struct CommandHistoryManager<H: SceneHost + ?Sized> {
    user: CommandStack<H>,
    collaboration: CommandStack<H>,
    collaboration_mode: bool,
    collab: CollaborationStats,
}

impl<H: SceneHost + ?Sized> Default for CommandHistoryManager<H> {
    fn default() -> Self {
        Self {
            user: CommandStack::default(),
            collaboration: CommandStack::non_recording(),
            collaboration_mode: false,
            collab: CollaborationStats::default(),
        }
    }
}

impl<H: SceneHost + ?Sized> std::fmt::Debug for CommandHistoryManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHistoryManager")
            .field("status", &self.undo_redo_status())
            .field("collaboration", &self.collab)
            .finish()
    }
}

impl<H: SceneHost + ?Sized> CommandHistoryManager<H> {
    /// Create empty histories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute through the user history; the command becomes undoable.
    ///
    /// # Errors
    ///
    /// Returns the command's error; nothing is recorded then.
    pub fn execute_as_user(
        &mut self,
        command: Box<dyn Command<H>>,
        host: &mut H,
    ) -> SyncResult<()> {
        let name = command.name();
        self.user.run(command, host, EventSource::Command)?;
        tracing::debug!(command = name, "user command executed");
        Self::announce(host);
        Ok(())
    }

    /// Execute without touching the user history.
    ///
    /// The collaboration mode flag is set for the duration and restored even
    /// if the command fails or panics.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn execute_as_collaboration(
        &mut self,
        command: Box<dyn Command<H>>,
        host: &mut H,
    ) -> SyncResult<()> {
        let name = command.name();
        let result = {
            let _mode = FlagGuard::set(&mut self.collaboration_mode, true);
            self.collaboration.run(command, host, EventSource::Collaboration)
        };
        match &result {
            Ok(()) => self.collab.executed += 1,
            Err(e) => {
                tracing::warn!(command = name, error = %e, "collaborative command failed");
                self.collab.failed += 1;
            }
        }
        result
    }

    /// Run `f` with user history recording disabled, restoring it afterwards.
    pub fn execute_without_recording<R>(
        &mut self,
        host: &mut H,
        f: impl FnOnce(&mut Self, &mut H) -> R,
    ) -> R {
        let mut paused = RecordingPaused::new(self);
        f(&mut *paused, host)
    }

    /// Undo the most recent user command. Returns false when there is none.
    ///
    /// # Errors
    ///
    /// Returns the command's error; the command is dropped then.
    pub fn undo(&mut self, host: &mut H) -> SyncResult<bool> {
        let Some(mut command) = self.user.undo.pop() else {
            return Ok(false);
        };
        command.revert(host, EventSource::Command)?;
        self.user.redo.push(command);
        Self::announce(host);
        Ok(true)
    }

    /// Redo the most recently undone user command. Returns false when there is none.
    ///
    /// # Errors
    ///
    /// Returns the command's error; the command is dropped then.
    pub fn redo(&mut self, host: &mut H) -> SyncResult<bool> {
        let Some(mut command) = self.user.redo.pop() else {
            return Ok(false);
        };
        command.execute(host, EventSource::Command)?;
        self.user.undo.push(command);
        Self::announce(host);
        Ok(true)
    }

    /// Whether a collaborative command is executing.
    #[must_use]
    pub fn is_collaboration_mode(&self) -> bool {
        self.collaboration_mode
    }

    /// The user history.
    #[must_use]
    pub fn user_stack(&self) -> &CommandStack<H> {
        &self.user
    }

    /// Undo/redo availability of the user history.
    #[must_use]
    pub fn undo_redo_status(&self) -> UndoRedoStatus {
        UndoRedoStatus {
            can_undo: !self.user.undo.is_empty(),
            can_redo: !self.user.redo.is_empty(),
            undo_depth: self.user.undo_depth(),
            redo_depth: self.user.redo_depth(),
            recording: self.user.recording,
            collaboration_mode: self.collaboration_mode,
        }
    }

    /// Counters of the collaboration history.
    #[must_use]
    pub fn collaboration_stats(&self) -> CollaborationStats {
        CollaborationStats {
            history_len: self.collaboration.undo_depth(),
            can_undo: self.collaboration.undo_depth() > 0,
            can_redo: self.collaboration.redo_depth() > 0,
            ..self.collab
        }
    }

    /// The collaboration history.
    #[must_use]
    pub fn collaboration_stack(&self) -> &CommandStack<H> {
        &self.collaboration
    }

    /// Drop both histories.
    pub fn clear(&mut self) {
        self.user.clear();
        self.collaboration.clear();
    }

    fn announce(host: &mut H) {
        let event = HostEvent::global(EventType::CommandStackChanged, host.now())
            .with_source(EventSource::Command);
        host.emit(event);
    }
}

/// Sets a flag and restores its previous value on drop.
struct FlagGuard<'a> {
    flag: &'a mut bool,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a mut bool, value: bool) -> Self {
        let previous = std::mem::replace(flag, value);
        Self { flag, previous }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        *self.flag = self.previous;
    }
}

/// Pauses user history recording until dropped.
struct RecordingPaused<'a, H: SceneHost + ?Sized> {
    manager: &'a mut CommandHistoryManager<H>,
    previous: bool,
}

impl<'a, H: SceneHost + ?Sized> RecordingPaused<'a, H> {
    fn new(manager: &'a mut CommandHistoryManager<H>) -> Self {
        let previous = std::mem::replace(&mut manager.user.recording, false);
        Self { manager, previous }
    }
}

impl<H: SceneHost + ?Sized> Deref for RecordingPaused<'_, H> {
    type Target = CommandHistoryManager<H>;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}

impl<H: SceneHost + ?Sized> DerefMut for RecordingPaused<'_, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.manager
    }
}

impl<H: SceneHost + ?Sized> Drop for RecordingPaused<'_, H> {
    fn drop(&mut self) {
        self.manager.user.recording = self.previous;
    }
}
