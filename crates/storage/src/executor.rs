//! The `StorageExecutor` trait — the contract every storage backend must fulfil.

use async_trait::async_trait;

use crate::{Batch, Outcome, StorageError};

/// Executes resolved statement batches.
///
/// Implementations return exactly one [`Outcome`] per statement, in order.
/// When `batch.atomic` is set, a failing statement must leave no trace of the
/// statements before it.
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    async fn execute(&self, batch: Batch) -> Result<Vec<Outcome>, StorageError>;
}
