//! Render handles - the host's graphical counterpart of an element.

use serde::{Deserialize, Serialize};

use crate::ElementKind;

/// Kind of graphics a handle draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderKind {
    /// Box-like graphics (shapes, labels, root layer).
    Shape,
    /// Polyline graphics.
    Connection,
}

impl RenderKind {
    /// Graphics kind used for an element kind.
    #[must_use]
    pub const fn for_element(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Connection => Self::Connection,
            ElementKind::Root | ElementKind::Shape | ElementKind::Label => Self::Shape,
        }
    }
}

/// Handle to an element's graphics in the render tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderHandle {
    /// Host-assigned handle identifier.
    pub handle_id: u64,
    /// Graphics kind.
    pub kind: RenderKind,
    /// Whether the graphics are attached to the live render tree.
    pub attached: bool,
    /// Number of updates applied to this handle.
    pub revision: u64,
}

/// Counters describing render activity, for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    /// Render handles created.
    pub handles_created: u64,
    /// Render handle updates performed.
    pub handle_updates: u64,
    /// Full redraws performed (explicit or on resume).
    pub redraws: u64,
    /// Updates that happened while rendering was suspended.
    pub deferred_updates: u64,
}
