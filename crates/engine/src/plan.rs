//! Turns an `(entity, operation, args)` descriptor into a [`Plan`]: one
//! [`Batch`] for the storage executor plus the recipe for shaping its
//! outcomes into the caller's JSON result.
//!
//! Planning is pure and synchronous; nothing here touches storage.

use chrono::{DateTime, SubsecRound, Utc};
use schema::{Entity, Join, Relation, SchemaRegistry};
use serde_json::{json, Value as Json};
use storage::{Batch, Outcome, StorageError};

use crate::aggregate::{Aggregates, Grouping};
use crate::query::Assembly;
use crate::{ClientConfig, Operation, QueryError};

/// Error path of `key` below `prefix`.
pub(crate) fn at(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Validates descriptors against a registry and builds statement batches.
pub struct Planner<'a> {
    pub(crate) registry: &'a SchemaRegistry,
    pub(crate) config: &'a ClientConfig,
    /// Timestamp used for every `now()` default and `updatedAt` field of the plan,
    /// cut to the millisecond precision values are rendered with.
    pub(crate) now: DateTime<Utc>,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a SchemaRegistry, config: &'a ClientConfig) -> Self {
        Self {
            registry,
            config,
            now: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn plan(&self, entity: &str, operation: Operation, args: &Json) -> Result<Plan, QueryError> {
        let model = self
            .registry
            .entity(entity)
            .map_err(|e| QueryError::validation(entity, "entity", e.to_string()))?;

        let mut batch = BatchBuilder::default();
        let finish = match operation {
            Operation::FindUnique => self.find_unique(&mut batch, model, args, false)?,
            Operation::FindUniqueOrThrow => self.find_unique(&mut batch, model, args, true)?,
            Operation::FindFirst => self.find_first(&mut batch, model, args, false)?,
            Operation::FindFirstOrThrow => self.find_first(&mut batch, model, args, true)?,
            Operation::FindMany => self.find_many(&mut batch, model, args)?,
            Operation::Count => self.count(&mut batch, model, args)?,
            Operation::Aggregate => self.aggregate(&mut batch, model, args)?,
            Operation::GroupBy => self.group_by(&mut batch, model, args)?,
            Operation::Create => self.create(&mut batch, model, args)?,
            Operation::CreateMany => self.create_many(&mut batch, model, args, false)?,
            Operation::CreateManyAndReturn => self.create_many(&mut batch, model, args, true)?,
            Operation::Update => self.update(&mut batch, model, args)?,
            Operation::UpdateMany => self.update_many(&mut batch, model, args, false)?,
            Operation::UpdateManyAndReturn => self.update_many(&mut batch, model, args, true)?,
            Operation::Upsert => self.upsert(&mut batch, model, args)?,
            Operation::Delete => self.delete(&mut batch, model, args)?,
            Operation::DeleteMany => self.delete_many(&mut batch, model, args)?,
        };

        Ok(Plan {
            entity: model.name.clone(),
            operation,
            batch: batch.finish(),
            finish,
        })
    }

    // -----------------------------------------------------------------------
    // Registry lookups with caller-facing errors
    // -----------------------------------------------------------------------

    pub(crate) fn target(&self, entity: &Entity, relation: &Relation, path: &str) -> Result<&'a Entity, QueryError> {
        self.registry
            .entity(&relation.target)
            .map_err(|e| QueryError::validation(&entity.name, path, e.to_string()))
    }

    pub(crate) fn join(&self, entity: &Entity, relation: &Relation, path: &str) -> Result<Join, QueryError> {
        self.registry
            .join(entity, relation)
            .map_err(|e| QueryError::validation(&entity.name, path, e.to_string()))
    }

    pub(crate) fn check_depth(&self, entity: &Entity, path: &str, depth: usize) -> Result<(), QueryError> {
        if depth > self.config.max_depth {
            return Err(QueryError::validation(
                &entity.name,
                path,
                format!("nesting exceeds the maximum depth of {}", self.config.max_depth),
            ));
        }
        Ok(())
    }
}

/// Plan `operation` on `entity` with a fresh [`Planner`].
pub fn plan(
    registry: &SchemaRegistry,
    config: &ClientConfig,
    entity: &str,
    operation: Operation,
    args: &Json,
) -> Result<Plan, QueryError> {
    Planner::new(registry, config).plan(entity, operation, args)
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Statements accumulated while planning; indexes double as step numbers.
#[derive(Debug, Default)]
pub(crate) struct BatchBuilder {
    statements: Vec<storage::Statement>,
}

impl BatchBuilder {
    pub(crate) fn push(&mut self, statement: storage::Statement) -> usize {
        self.statements.push(statement);
        self.statements.len() - 1
    }

    fn finish(self) -> Batch {
        let atomic = self.statements.len() > 1 || self.statements.iter().any(|s| s.is_write());
        Batch {
            statements: self.statements,
            atomic,
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// How the outcomes of a plan's batch become the caller's result.
#[derive(Debug, Clone)]
pub(crate) enum Finish {
    Rows { step: usize, assembly: Assembly },
    Row { step: usize, assembly: Assembly, required: bool },
    Count { step: usize },
    /// `{"count": n}` with the number of rows written by `step`.
    Affected { step: usize },
    Aggregate { step: usize, aggregates: Aggregates },
    Groups { step: usize, grouping: Grouping },
}

/// A validated operation ready to be sent to a storage executor.
#[derive(Debug, Clone)]
pub struct Plan {
    pub entity: String,
    pub operation: Operation,
    pub batch: Batch,
    pub(crate) finish: Finish,
}

impl Plan {
    /// Human-readable description of the batch.
    pub fn explain(&self) -> Json {
        json!({
            "entity": self.entity,
            "operation": self.operation,
            "batch": self.batch,
        })
    }

    /// Shape the executor's outcomes into the operation's result.
    pub fn finish(&self, outcomes: &[Outcome]) -> Result<Json, QueryError> {
        if outcomes.len() != self.batch.statements.len() {
            return Err(QueryError::Storage(StorageError::Backend(format!(
                "executor returned {} outcomes for {} statements",
                outcomes.len(),
                self.batch.statements.len()
            ))));
        }
        match &self.finish {
            Finish::Rows { step, assembly } => Ok(Json::Array(
                outcomes[*step]
                    .rows()
                    .iter()
                    .map(|row| assembly.render(row, outcomes))
                    .collect(),
            )),
            Finish::Row { step, assembly, required } => match outcomes[*step].rows().first() {
                Some(row) => Ok(assembly.render(row, outcomes)),
                None if *required => Err(QueryError::NotFound {
                    entity: self.entity.clone(),
                    operation: self.operation.as_str().to_owned(),
                }),
                None => Ok(Json::Null),
            },
            Finish::Count { step } => match &outcomes[*step] {
                Outcome::Count(n) => Ok(json!(n)),
                other => Err(unexpected(*step, other)),
            },
            Finish::Affected { step } => Ok(json!({ "count": outcomes[*step].rows().len() })),
            Finish::Aggregate { step, aggregates } => Ok(aggregates.compute(outcomes[*step].rows())),
            Finish::Groups { step, grouping } => Ok(Json::Array(grouping.groups(outcomes[*step].rows()))),
        }
    }
}

fn unexpected(step: usize, outcome: &Outcome) -> QueryError {
    QueryError::Storage(StorageError::Backend(format!(
        "unexpected outcome for statement {step}: {outcome:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::platform::platform_registry;
    use storage::{Filter, Statement};

    #[test]
    fn paths_nest_below_their_prefix() {
        assert_eq!(at("", "where"), "where");
        assert_eq!(at("include.workflows", "where"), "include.workflows.where");
    }

    #[test]
    fn unknown_entities_fail_validation() {
        let registry = platform_registry().unwrap();
        let err = plan(&registry, &ClientConfig::default(), "Invoice", Operation::FindMany, &Json::Null).unwrap_err();
        assert!(matches!(err, QueryError::Validation { path, .. } if path == "entity"));
    }

    #[test]
    fn single_reads_are_not_atomic() {
        let registry = platform_registry().unwrap();
        let plan = plan(&registry, &ClientConfig::default(), "User", Operation::FindMany, &json!({})).unwrap();
        assert!(!plan.batch.atomic);
        assert_eq!(plan.batch.statements.len(), 1);
        assert!(matches!(
            &plan.batch.statements[0],
            Statement::Find { filter, .. } if *filter == Filter::all()
        ));
    }

    #[test]
    fn writes_are_always_atomic() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::DeleteMany,
            &json!({"where": {"email": "a@x.com"}}),
        )
        .unwrap();
        assert!(plan.batch.atomic);
    }

    #[test]
    fn explain_names_the_operation() {
        let registry = platform_registry().unwrap();
        let plan = plan(&registry, &ClientConfig::default(), "User", Operation::Count, &json!({})).unwrap();
        let explained = plan.explain();
        assert_eq!(explained["operation"], json!("count"));
        assert_eq!(explained["batch"]["statements"][0]["statement"], json!("count"));
    }

    #[test]
    fn mismatched_outcomes_are_a_storage_error() {
        let registry = platform_registry().unwrap();
        let plan = plan(&registry, &ClientConfig::default(), "User", Operation::Count, &json!({})).unwrap();
        assert!(matches!(plan.finish(&[]), Err(QueryError::Storage(_))));
        assert_eq!(plan.finish(&[Outcome::Count(3)]).unwrap(), json!(3));
    }
}
