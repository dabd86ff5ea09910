//! # Duet Core
//!
//! Document model and scene graph host contract for collaborative diagram editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  duet-core                  │
//! ├─────────────────────────────────────────────┤
//! │  Document Arena   │  Scene Graph Host       │
//! │  - Elements       │  - Render handles       │
//! │  - Id-only links  │  - Suspend / redraw     │
//! │  - Model objects  │  - Event bus            │
//! ├─────────────────────────────────────────────┤
//! │  Modeling API (event-emitting + silent)     │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod element;
pub mod error;
pub mod event;
pub mod host;
pub mod memory;
pub mod modeling;
pub mod render;
pub mod schema;

pub use element::{Bounds, BusinessObject, Element, ElementId, ElementKind, Point};
pub use error::{CoreError, CoreResult};
pub use event::{Emission, EventBus, EventSource, EventType, HostEvent, ListenerId};
pub use host::SceneHost;
pub use memory::{MemoryHost, ROOT_ID};
pub use render::{RenderHandle, RenderKind, RenderStats};
pub use schema::{DiagramDocument, ElementDocument};

/// Duet core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
