//! Error types for the audit pipeline.

use thiserror::Error;

/// Main error type for the audit pipeline.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Configuration-related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Input handed to the truncation engine was not valid JSON.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Event failed validation and must not be enqueued.
    #[error("Validation error: {kind}")]
    Validation { kind: ValidationErrorKind },

    /// Enqueue was refused by the async logger.
    #[error("Queue error: {kind}")]
    Queue { kind: QueueErrorKind },

    /// A persistence sink failed to store one or more events.
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuditError {
    /// Returns `true` for the backpressure signal of a saturated queue.
    pub fn is_queue_full(&self) -> bool {
        matches!(
            self,
            AuditError::Queue {
                kind: QueueErrorKind::Full { .. }
            }
        )
    }

    /// Returns `true` if the event was rejected by validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, AuditError::Validation { .. })
    }
}

/// Validation error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    #[error("Action is not set")]
    MissingAction,

    #[error("Unknown action: {name}")]
    UnknownAction { name: String },

    #[error("Request ID is empty")]
    EmptyRequestId,

    #[error("Resource type is empty")]
    EmptyResourceType,

    #[error("{field} is {size} bytes, exceeding the {max} byte ceiling")]
    ObjectTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
}

/// Queue error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueErrorKind {
    #[error("Audit queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("Audit logger is stopped")]
    Closed,
}

/// Result type alias for audit pipeline operations.
pub type AuditResult<T> = Result<T, AuditError>;
