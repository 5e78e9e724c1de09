//! Storage-level error type.

use thiserror::Error;

/// Errors returned by a [`StorageExecutor`](crate::StorageExecutor).
///
/// Constraint failures carry enough context for the engine to map them onto
/// its own taxonomy without inspecting messages:
/// - `UniqueViolation`     — a write collided with a unique constraint.
/// - `ForeignKeyViolation` — a write referenced a missing row, or a delete hit a
///   restricting dependent.
/// - `RecordNotFound`      — a required row (or a linked step row) was absent.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("unique constraint '{constraint}' on '{entity}' violated (fields: {fields:?})")]
    UniqueViolation {
        entity: String,
        constraint: String,
        fields: Vec<String>,
    },

    #[error("foreign key constraint '{entity}.{relation}' -> '{target}' violated")]
    ForeignKeyViolation {
        entity: String,
        relation: String,
        target: String,
    },

    #[error("no '{entity}' record found for {operation}")]
    RecordNotFound { entity: String, operation: String },

    /// The statement is malformed for this executor (unknown entity, bad step reference).
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// Executor options could not be applied.
    #[error("invalid executor configuration: {0}")]
    Config(String),

    /// Connectivity, timeout or engine fault.
    #[error("storage backend error: {0}")]
    Backend(String),
}
