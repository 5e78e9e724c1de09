//! `schema` crate — the Schema Registry.
//!
//! Describes entities, fields, relations, unique constraints and enums, and
//! converts caller JSON into typed [`Value`]s. Ships the platform schema in
//! [`platform`]. No storage and no query logic lives here.

pub mod error;
pub mod model;
pub mod platform;
pub mod registry;
pub mod value;

pub use error::{SchemaError, ValueError};
pub use model::{
    Cardinality, Entity, Field, FieldDefault, Join, ReferentialAction, Relation, RelationLink,
    ScalarKind, UniqueConstraint,
};
pub use registry::{RegistryBuilder, SchemaRegistry};
pub use value::Value;
