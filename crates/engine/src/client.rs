//! The query client.
//!
//! `Client` is the facade callers hold: it plans an operation against the
//! shared registry and configuration, hands the batch to a
//! [`StorageExecutor`], and shapes the outcomes into the result.
//! [`EntityClient`] adds typed per-entity methods on top of [`Client::execute`].

use std::sync::Arc;

use schema::SchemaRegistry;
use serde_json::Value as Json;
use storage::{StorageError, StorageExecutor};
use tracing::{debug, info, instrument, warn};

use crate::{ClientConfig, Descriptor, Operation, Plan, Planner, QueryError};

/// Plans and runs operations against one storage executor.
///
/// Cheap to clone; clones share the registry, executor and configuration.
#[derive(Clone)]
pub struct Client {
    registry: Arc<SchemaRegistry>,
    executor: Arc<dyn StorageExecutor>,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("entities", &self.registry.entities().count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client, validating `config` against `registry`.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        executor: Arc<dyn StorageExecutor>,
        config: ClientConfig,
    ) -> Result<Self, QueryError> {
        config.validate(&registry)?;
        info!(
            entities = registry.entities().count(),
            max_depth = config.max_depth,
            "query client ready"
        );
        Ok(Self {
            registry,
            executor,
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate and plan without touching storage.
    pub fn plan(&self, entity: &str, operation: Operation, args: &Json) -> Result<Plan, QueryError> {
        Planner::new(&self.registry, &self.config).plan(entity, operation, args)
    }

    /// Plan and run one operation.
    ///
    /// Validation failures are returned before the executor is called.
    #[instrument(skip_all, fields(entity = %entity, operation = %operation))]
    pub async fn execute(&self, entity: &str, operation: Operation, args: &Json) -> Result<Json, QueryError> {
        let plan = self.plan(entity, operation, args)?;
        self.run(&plan).await
    }

    /// Run an already validated plan.
    pub async fn run(&self, plan: &Plan) -> Result<Json, QueryError> {
        debug!(
            statements = plan.batch.statements.len(),
            atomic = plan.batch.atomic,
            "executing batch"
        );
        let result = match self.executor.execute(plan.batch.clone()).await {
            Ok(outcomes) => plan.finish(&outcomes),
            Err(error) => Err(QueryError::from(error)),
        };
        if let Err(error) = &result {
            warn!(entity = %plan.entity, operation = %plan.operation, %error, "operation failed");
        }
        result
    }

    /// Run a descriptor as read from a file.
    pub async fn dispatch(&self, descriptor: &Descriptor) -> Result<Json, QueryError> {
        self.execute(&descriptor.entity, descriptor.operation, &descriptor.args)
            .await
    }

    /// Typed operations on one entity.
    pub fn entity(&self, name: impl Into<String>) -> EntityClient<'_> {
        EntityClient {
            client: self,
            entity: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityClient
// ---------------------------------------------------------------------------

/// `client.entity("User").find_many(...)`-style access.
#[derive(Debug, Clone)]
pub struct EntityClient<'c> {
    client: &'c Client,
    entity: String,
}

impl EntityClient<'_> {
    pub fn name(&self) -> &str {
        &self.entity
    }

    async fn call(&self, operation: Operation, args: Json) -> Result<Json, QueryError> {
        self.client.execute(&self.entity, operation, &args).await
    }

    pub async fn find_unique(&self, args: Json) -> Result<Option<Json>, QueryError> {
        Ok(optional(self.call(Operation::FindUnique, args).await?))
    }

    pub async fn find_unique_or_throw(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::FindUniqueOrThrow, args).await
    }

    pub async fn find_first(&self, args: Json) -> Result<Option<Json>, QueryError> {
        Ok(optional(self.call(Operation::FindFirst, args).await?))
    }

    pub async fn find_first_or_throw(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::FindFirstOrThrow, args).await
    }

    pub async fn find_many(&self, args: Json) -> Result<Vec<Json>, QueryError> {
        rows(self.call(Operation::FindMany, args).await?)
    }

    pub async fn count(&self, args: Json) -> Result<u64, QueryError> {
        let value = self.call(Operation::Count, args).await?;
        value.as_u64().ok_or_else(|| malformed("count", &value))
    }

    pub async fn aggregate(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::Aggregate, args).await
    }

    pub async fn group_by(&self, args: Json) -> Result<Vec<Json>, QueryError> {
        rows(self.call(Operation::GroupBy, args).await?)
    }

    pub async fn create(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::Create, args).await
    }

    /// Number of rows inserted.
    pub async fn create_many(&self, args: Json) -> Result<u64, QueryError> {
        affected(self.call(Operation::CreateMany, args).await?)
    }

    pub async fn create_many_and_return(&self, args: Json) -> Result<Vec<Json>, QueryError> {
        rows(self.call(Operation::CreateManyAndReturn, args).await?)
    }

    pub async fn update(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::Update, args).await
    }

    /// Number of rows updated.
    pub async fn update_many(&self, args: Json) -> Result<u64, QueryError> {
        affected(self.call(Operation::UpdateMany, args).await?)
    }

    pub async fn update_many_and_return(&self, args: Json) -> Result<Vec<Json>, QueryError> {
        rows(self.call(Operation::UpdateManyAndReturn, args).await?)
    }

    pub async fn upsert(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::Upsert, args).await
    }

    /// The deleted row, as it was before deletion.
    pub async fn delete(&self, args: Json) -> Result<Json, QueryError> {
        self.call(Operation::Delete, args).await
    }

    /// Number of rows deleted.
    pub async fn delete_many(&self, args: Json) -> Result<u64, QueryError> {
        affected(self.call(Operation::DeleteMany, args).await?)
    }
}

fn optional(value: Json) -> Option<Json> {
    match value {
        Json::Null => None,
        other => Some(other),
    }
}

fn rows(value: Json) -> Result<Vec<Json>, QueryError> {
    match value {
        Json::Array(items) => Ok(items),
        other => Err(malformed("a list", &other)),
    }
}

fn affected(value: Json) -> Result<u64, QueryError> {
    value
        .get("count")
        .and_then(Json::as_u64)
        .ok_or_else(|| malformed("{\"count\": n}", &value))
}

fn malformed(expected: &str, found: &Json) -> QueryError {
    QueryError::Storage(StorageError::Backend(format!("expected {expected}, got {found}")))
}
