//! `MemoryStore` — an in-memory, transactional [`StorageExecutor`].
//!
//! Serves as the test double for the engine (it records every batch it
//! receives and keeps side-effect counters) and as the backing store of the
//! CLI. Batches are serialised behind a mutex; atomic batches are rolled back
//! from a snapshot when any statement fails.

mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::statement::{Batch, Outcome, Record};
use crate::{StorageError, StorageExecutor};

use session::Session;

/// Options read from the opaque executor configuration map.
///
/// Keys meant for other executors (connection strings, pool sizes) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryOptions {
    /// Log every statement at `info` rather than `debug`.
    pub log_statements: bool,
}

/// Side-effect counters, rolled back together with the tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub upsert_creates: u64,
    pub upsert_updates: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct State {
    pub(crate) tables: HashMap<String, Vec<Record>>,
    pub(crate) stats: MemoryStats,
}

pub struct MemoryStore {
    registry: Arc<SchemaRegistry>,
    options: MemoryOptions,
    state: Mutex<State>,
    /// All batches seen by this store (in call order).
    calls: Arc<Mutex<Vec<Batch>>>,
}

impl MemoryStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            options: MemoryOptions::default(),
            state: Mutex::new(State::default()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build a store from the client's pass-through executor options.
    pub fn with_options(
        registry: Arc<SchemaRegistry>,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, StorageError> {
        let options: MemoryOptions = serde_json::from_value(serde_json::Value::Object(options.clone()))
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(Self {
            options,
            ..Self::new(registry)
        })
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock_state().stats
    }

    /// Current rows of `entity`, in insertion order.
    pub fn rows(&self, entity: &str) -> Vec<Record> {
        self.lock_state().tables.get(entity).cloned().unwrap_or_default()
    }

    /// Every batch received so far.
    pub fn calls(&self) -> Vec<Batch> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of batches this store has executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageExecutor for MemoryStore {
    async fn execute(&self, batch: Batch) -> Result<Vec<Outcome>, StorageError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());

        let mut state = self.lock_state();
        let snapshot = batch.atomic.then(|| state.clone());
        let mut outcomes = Vec::with_capacity(batch.statements.len());

        for (index, statement) in batch.statements.iter().enumerate() {
            if self.options.log_statements {
                info!(step = index, entity = statement.entity(), ?statement, "executing statement");
            } else {
                debug!(step = index, entity = statement.entity(), "executing statement");
            }

            let before = snapshot.is_none().then(|| state.clone());
            let result = Session::new(&self.registry, &mut state, &outcomes).run(statement);
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(step = index, error = %e, atomic = batch.atomic, "statement failed, rolling back");
                    if let Some(restore) = snapshot.or(before) {
                        *state = restore;
                    }
                    return Err(e);
                }
            }
        }

        Ok(outcomes)
    }
}
