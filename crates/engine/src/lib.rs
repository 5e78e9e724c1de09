//! `engine` crate — the typed query algebra.
//!
//! Callers describe an operation as an entity, an [`Operation`] and a JSON
//! argument object. The [`Planner`] validates it against the schema registry
//! and resolves it into one storage batch; [`Client`] runs that batch through
//! a [`storage::StorageExecutor`] and shapes the outcomes into the result.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod order;
pub mod plan;
pub mod projection;
pub mod query;
pub mod write;

pub use client::{Client, EntityClient};
pub use config::ClientConfig;
pub use descriptor::{Descriptor, Operation};
pub use error::QueryError;
pub use plan::{plan, Plan, Planner};
pub use projection::{Member, Projection};

#[cfg(test)]
mod client_tests;
