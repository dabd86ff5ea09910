//! Errors raised inside the synchronization core.
//!
//! None of these escape `apply_remote_changes` or `queue_sync`; they are
//! logged and converted into skip/retry/repair outcomes at that boundary.

use duet_core::CoreError;

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while applying or scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Element or connection endpoint missing.
    #[error("Element not found: {0}")]
    ElementNotFound(String),
    /// Payload malformed beyond sanitizing.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    /// Attempt to write a read-only or structural property.
    #[error("Write rejected for {element_id}: {property}")]
    WriteRejected {
        /// Element the write targeted.
        element_id: String,
        /// Property that was refused.
        property: String,
    },
    /// Handler failure worth retrying.
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Error reported by the scene graph host.
    #[error("Host error: {0}")]
    Host(#[from] CoreError),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the queue should retry the operation that produced this error.
    ///
    /// Host render failures and explicit transient failures are retried;
    /// missing elements and malformed payloads are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Host(core) => matches!(core, CoreError::Render(_)),
            Self::ElementNotFound(_)
            | Self::InvalidPayload(_)
            | Self::WriteRejected { .. }
            | Self::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Transient("busy".into()).is_retryable());
        assert!(SyncError::Host(CoreError::Render("gpu lost".into())).is_retryable());
        assert!(!SyncError::Host(CoreError::ElementNotFound("x".into())).is_retryable());
        assert!(!SyncError::ElementNotFound("Task_1".into()).is_retryable());
        assert!(!SyncError::InvalidPayload("nan".into()).is_retryable());
    }

    #[test]
    fn test_write_rejected_message() {
        let err = SyncError::WriteRejected {
            element_id: "Task_1".into(),
            property: "children".into(),
        };
        assert_eq!(err.to_string(), "Write rejected for Task_1: children");
    }
}
