//! `storage` crate — the Storage Executor contract and an in-memory executor.
//!
//! The engine resolves every operation into a [`Batch`] of [`Statement`]s and
//! hands it to a [`StorageExecutor`]. [`MemoryStore`] evaluates batches over
//! in-memory tables and enforces unique and referential constraints.

pub mod error;
pub mod eval;
pub mod executor;
pub mod memory;
pub mod statement;
pub mod window;

pub use error::StorageError;
pub use executor::StorageExecutor;
pub use memory::{MemoryOptions, MemoryStats, MemoryStore};
pub use statement::{
    AssignOp, Assignment, Batch, CompareOp, Condition, Direction, FieldFilter, Filter, JsonCondition, JsonOp,
    JsonTarget, Link, NullsOrder, OrderBy, OrderKey, Outcome, Quantifier, Record, RelationFilter, Statement, Tally,
    TextOp, Window,
};
