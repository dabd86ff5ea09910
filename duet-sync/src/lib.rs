//! # Duet Sync
//!
//! Anti-feedback synchronization core for collaborative diagram editing.
//! Remote changes are applied silently and never rebroadcast, local changes
//! are deduplicated and batched, and remote edits stay out of the user's
//! undo history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      CollabSession                       │
//! ├──────────────────────────────────────────────────────────┤
//! │  CollaborationManager        │  SynchronizationManager   │
//! │  - host event filtering      │  - FIFO queue + retries   │
//! │  - remote application        │  - handler table          │
//! │  - outbound operations       │  - consistency audit      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ChangeTracker │ SilentMutationApplier │ EventSuppression │
//! ├──────────────────────────────────────────────────────────┤
//! │  CommandHistoryManager (user / collaboration)            │
//! ├──────────────────────────────────────────────────────────┤
//! │  Scheduler (virtual time)    │  runtime::drive (tokio)   │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                   duet_core::SceneHost
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod applier;
pub mod collaboration;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod operation;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod suppression;
pub mod synchronization;
pub mod tracker;

pub use applier::{SilentMutationApplier, SilentUpdate};
pub use collaboration::{CollaborationManager, RemoteApplyReport};
pub use config::SyncConfig;
pub use context::{ApplyContext, CollaborationContext, ElementPhase};
pub use error::{SyncError, SyncResult};
pub use history::{
    Command, CommandHistoryManager, CreateElementCommand, MoveShapeCommand,
    UpdatePropertiesCommand,
};
pub use operation::{
    parse_wire, ChangeOperation, ChangePayload, ElementSpec, OperationId, OperationKind, Origin,
    VisualChange,
};
pub use scheduler::{Scheduler, TaskId, TimerTask, Timers};
pub use session::{CollabSession, SessionStats, WireMessage};
pub use suppression::EventSuppressionManager;
pub use synchronization::{
    AuditReport, ConsistencyIssue, IssueKind, SyncQueueEntry, SyncStatus, SynchronizationManager,
};
pub use tracker::{ChangeCategory, ChangeTracker};

/// Duet sync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
