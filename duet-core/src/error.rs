//! Error types for document and host operations.

use thiserror::Error;

/// Result type for document and host operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while reading or mutating the scene graph host.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Element not found in the document arena.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// An element with the same ID is already present.
    #[error("Duplicate element: {0}")]
    DuplicateElement(String),

    /// Invalid operation on an element (wrong kind, structural violation).
    #[error("Invalid operation on element: {0}")]
    InvalidOperation(String),

    /// The render layer rejected a handle operation.
    #[error("Rendering error: {0}")]
    Render(String),

    /// Document serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
