//! Typed error types for the schema crate.

use thiserror::Error;

/// Errors raised while building or querying a [`SchemaRegistry`](crate::SchemaRegistry).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("entity '{0}' is declared twice")]
    DuplicateEntity(String),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("'{name}' is declared twice on entity '{entity}'")]
    DuplicateMember { entity: String, name: String },

    /// Names starting with `_` are reserved for pseudo-fields such as `_count`.
    #[error("'{name}' on entity '{entity}' uses the reserved '_' prefix")]
    ReservedName { entity: String, name: String },

    #[error("field '{entity}.{field}' uses undeclared enum '{name}'")]
    UnknownEnum {
        entity: String,
        field: String,
        name: String,
    },

    #[error("entity '{entity}' has an invalid identity: {reason}")]
    InvalidIdentity { entity: String, reason: String },

    #[error("unique constraint '{constraint}' on '{entity}' is invalid: {reason}")]
    InvalidUnique {
        entity: String,
        constraint: String,
        reason: String,
    },

    #[error("relation '{entity}.{relation}' is invalid: {reason}")]
    InvalidRelation {
        entity: String,
        relation: String,
        reason: String,
    },
}

/// Errors raised when converting caller JSON into a typed [`Value`](crate::Value).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("'{value}' is not a variant of enum '{name}'")]
    UnknownVariant { name: String, value: String },

    #[error("invalid {kind} literal '{value}'")]
    InvalidLiteral { kind: &'static str, value: String },
}
