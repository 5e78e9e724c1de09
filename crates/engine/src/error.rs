//! Engine-level error types.

use storage::StorageError;
use thiserror::Error;

/// Errors produced by the query engine (validation + execution).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    // ------ Validation errors ------

    /// The descriptor is malformed; raised before any storage call.
    #[error("invalid {entity} query at '{path}': {message}")]
    Validation {
        entity: String,
        path: String,
        message: String,
    },

    // ------ Execution errors ------

    /// A required row was absent: an `...OrThrow` read, a single-row
    /// update/delete or a nested `connect` target.
    #[error("no {entity} record found for {operation}")]
    NotFound { entity: String, operation: String },

    #[error("unique constraint '{constraint}' on {entity} violated (fields: {fields:?})")]
    UniqueConstraintViolation {
        entity: String,
        constraint: String,
        fields: Vec<String>,
    },

    #[error("foreign key '{entity}.{relation}' -> {target} violated")]
    ForeignKeyViolation {
        entity: String,
        relation: String,
        target: String,
    },

    /// Any other executor failure, passed through untouched.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl QueryError {
    pub(crate) fn validation(entity: &str, path: &str, message: impl Into<String>) -> Self {
        QueryError::Validation {
            entity: entity.to_owned(),
            path: path.to_owned(),
            message: message.into(),
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::UniqueViolation { entity, constraint, fields } => {
                QueryError::UniqueConstraintViolation { entity, constraint, fields }
            }
            StorageError::ForeignKeyViolation { entity, relation, target } => {
                QueryError::ForeignKeyViolation { entity, relation, target }
            }
            StorageError::RecordNotFound { entity, operation } => QueryError::NotFound { entity, operation },
            other => QueryError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_failures_keep_their_context() {
        let mapped: QueryError = StorageError::UniqueViolation {
            entity: "User".into(),
            constraint: "email".into(),
            fields: vec!["email".into()],
        }
        .into();
        assert_eq!(
            mapped,
            QueryError::UniqueConstraintViolation {
                entity: "User".into(),
                constraint: "email".into(),
                fields: vec!["email".into()],
            }
        );

        let opaque: QueryError = StorageError::Backend("connection reset".into()).into();
        assert!(matches!(opaque, QueryError::Storage(StorageError::Backend(_))));
    }
}
