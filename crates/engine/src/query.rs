//! Query Planner, read path.
//!
//! A read is one [`Batch`](storage::Batch): the root `Find`, then one `Find`
//! per included relation filtered back to its parent step, then one `Tally`
//! per relation count. [`Assembly`] stitches the outcomes back together.

use schema::{Entity, Join};
use serde_json::{Map, Value as Json};
use storage::eval::{field_value, project};
use storage::{Filter, OrderBy, Outcome, Quantifier, Record, RelationFilter, Statement, Window};

use crate::descriptor::{parse_args, CountArgs, FindArgs, UniqueArgs};
use crate::order::tiebreak;
use crate::plan::{at, BatchBuilder, Finish, Planner};
use crate::projection::Shape;
use crate::QueryError;

/// Filter, order and window of one `Find`.
#[derive(Debug, Clone)]
pub(crate) struct ScopedRead {
    pub filter: Filter,
    pub order: Vec<OrderBy>,
    pub window: Window,
}

impl Default for ScopedRead {
    fn default() -> Self {
        Self {
            filter: Filter::all(),
            order: Vec::new(),
            window: Window::default(),
        }
    }
}

/// How to turn the rows of one step into caller JSON.
#[derive(Debug, Clone, Default)]
pub(crate) struct Assembly {
    scalars: Vec<String>,
    relations: Vec<LoadedRelation>,
    counts: Vec<LoadedCount>,
}

#[derive(Debug, Clone)]
struct LoadedRelation {
    name: String,
    step: usize,
    join: Join,
    to_many: bool,
    assembly: Assembly,
}

#[derive(Debug, Clone)]
struct LoadedCount {
    name: String,
    step: usize,
    join: Join,
}

impl Assembly {
    pub(crate) fn render(&self, row: &Record, outcomes: &[Outcome]) -> Json {
        let mut object = Map::new();
        for name in &self.scalars {
            object.insert(name.clone(), field_value(row, name).to_json());
        }
        for relation in &self.relations {
            let key = project(row, &relation.join.local);
            let mut children = outcomes[relation.step]
                .rows()
                .iter()
                .filter(|child| !key.iter().any(|v| v.is_null()) && project(child, &relation.join.remote) == key)
                .map(|child| relation.assembly.render(child, outcomes));
            let value = if relation.to_many {
                Json::Array(children.collect())
            } else {
                children.next().unwrap_or(Json::Null)
            };
            object.insert(relation.name.clone(), value);
        }
        if !self.counts.is_empty() {
            let mut counts = Map::new();
            for count in &self.counts {
                let key = project(row, &count.join.local);
                let n = match &outcomes[count.step] {
                    Outcome::Tallies(tallies) => tallies.iter().find(|t| t.key == key).map_or(0, |t| t.count),
                    _ => 0,
                };
                counts.insert(count.name.clone(), Json::from(n));
            }
            object.insert("_count".to_owned(), Json::Object(counts));
        }
        Json::Object(object)
    }
}

impl Planner<'_> {
    /// `where`, `orderBy` (with the identity tie-breaker) and the window of a
    /// findMany-style argument object.
    pub(crate) fn scoped_read(&self, entity: &Entity, args: &FindArgs, path: &str) -> Result<ScopedRead, QueryError> {
        let filter = match &args.filter {
            Some(json) => self.parse_filter(entity, json, &at(path, "where"))?,
            None => Filter::all(),
        };
        let order = self.parse_order_by(entity, args.order_by.as_ref(), &at(path, "orderBy"))?;
        let window = self.parse_window(
            entity,
            args.cursor.as_ref(),
            args.skip,
            args.take,
            args.distinct.as_ref(),
            path,
        )?;
        Ok(ScopedRead {
            filter,
            order: tiebreak(entity, order),
            window,
        })
    }

    /// Push the root `Find` and every relation load of `shape`.
    pub(crate) fn plan_read(&self, batch: &mut BatchBuilder, read: ScopedRead, shape: &Shape) -> (usize, Assembly) {
        let step = batch.push(Statement::Find {
            entity: shape.entity.clone(),
            filter: read.filter,
            order: read.order,
            window: read.window,
        });
        (step, self.loads(batch, step, shape))
    }

    /// Push the relation loads of `shape` for the rows produced by `step`.
    pub(crate) fn loads(&self, batch: &mut BatchBuilder, step: usize, shape: &Shape) -> Assembly {
        let mut assembly = Assembly {
            scalars: shape.scalars.clone(),
            ..Assembly::default()
        };
        for relation in &shape.relations {
            let mut window = relation.read.window.clone();
            if relation.to_many {
                window.partition = relation.join.remote.clone();
            }
            let filter = Filter::and(vec![
                of_parents(&relation.join, &shape.entity, step),
                relation.read.filter.clone(),
            ]);
            let (child, nested) = self.plan_read(
                batch,
                ScopedRead {
                    filter,
                    order: relation.read.order.clone(),
                    window,
                },
                &relation.shape,
            );
            assembly.relations.push(LoadedRelation {
                name: relation.name.clone(),
                step: child,
                join: relation.join.clone(),
                to_many: relation.to_many,
                assembly: nested,
            });
        }
        for count in &shape.counts {
            let tally = batch.push(Statement::Tally {
                entity: count.join.target.clone(),
                filter: Filter::and(vec![of_parents(&count.join, &shape.entity, step), count.filter.clone()]),
                by: count.join.remote.clone(),
            });
            assembly.counts.push(LoadedCount {
                name: count.name.clone(),
                step: tally,
                join: count.join.clone(),
            });
        }
        assembly
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub(crate) fn find_unique(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        args: &Json,
        required: bool,
    ) -> Result<Finish, QueryError> {
        let args: UniqueArgs = parse_args(&entity.name, "args", args)?;
        let unique = self.parse_unique(entity, &args.filter, "where", false)?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let read = ScopedRead {
            filter: unique.to_filter(),
            ..ScopedRead::default()
        };
        let (step, assembly) = self.plan_read(batch, read, &shape);
        Ok(Finish::Row { step, assembly, required })
    }

    pub(crate) fn find_first(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        args: &Json,
        required: bool,
    ) -> Result<Finish, QueryError> {
        let mut args: FindArgs = parse_args(&entity.name, "args", args)?;
        args.take = Some(match args.take {
            Some(take) if take < 0 => -1,
            _ => 1,
        });
        let read = self.scoped_read(entity, &args, "")?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let (step, assembly) = self.plan_read(batch, read, &shape);
        Ok(Finish::Row { step, assembly, required })
    }

    pub(crate) fn find_many(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: FindArgs = parse_args(&entity.name, "args", args)?;
        let read = self.scoped_read(entity, &args, "")?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let (step, assembly) = self.plan_read(batch, read, &shape);
        Ok(Finish::Rows { step, assembly })
    }

    pub(crate) fn count(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: CountArgs = parse_args(&entity.name, "args", args)?;
        let read = self.scoped_read(
            entity,
            &FindArgs {
                filter: args.filter,
                order_by: args.order_by,
                cursor: args.cursor,
                take: args.take,
                skip: args.skip,
                distinct: args.distinct,
                ..FindArgs::default()
            },
            "",
        )?;
        let step = batch.push(Statement::Count {
            entity: entity.name.clone(),
            filter: read.filter,
            order: read.order,
            window: read.window,
        });
        Ok(Finish::Count { step })
    }
}

/// Rows of `join.target` related to the rows `step` produced for `parent`.
fn of_parents(join: &Join, parent: &str, step: usize) -> Filter {
    Filter::Relation(RelationFilter {
        join: join.reversed(parent),
        quantifier: Quantifier::Some,
        filter: Box::new(Filter::Step(step)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{plan, ClientConfig, Operation};
    use schema::platform::platform_registry;
    use schema::Value;
    use serde_json::json;
    use storage::Tally;

    fn row(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    #[test]
    fn includes_become_partitioned_loads() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::FindMany,
            &json!({"include": {"workflows": {"take": 1}}}),
        )
        .unwrap();
        assert_eq!(plan.batch.statements.len(), 2);
        let Statement::Find { entity, window, filter, .. } = &plan.batch.statements[1] else {
            panic!("expected a find");
        };
        assert_eq!(entity, "Workflow");
        assert_eq!(window.partition, vec!["userId".to_string()]);
        assert_eq!(window.take, Some(1));
        assert!(matches!(filter, Filter::Relation(r) if *r.filter == Filter::Step(0)));
    }

    #[test]
    fn assembly_nests_children_under_their_parent() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::FindMany,
            &json!({
                "select": {"id": true, "workflows": {"select": {"id": true}}, "_count": {"select": {"workflows": true}}}
            }),
        )
        .unwrap();
        let outcomes = vec![
            Outcome::Rows(vec![row(&[("id", "u1")]), row(&[("id", "u2")])]),
            Outcome::Rows(vec![
                row(&[("id", "w1"), ("userId", "u1")]),
                row(&[("id", "w2"), ("userId", "u1")]),
            ]),
            Outcome::Tallies(vec![Tally {
                key: vec![Value::from("u1")],
                count: 2,
            }]),
        ];
        assert_eq!(
            plan.finish(&outcomes).unwrap(),
            json!([
                {"id": "u1", "workflows": [{"id": "w1"}, {"id": "w2"}], "_count": {"workflows": 2}},
                {"id": "u2", "workflows": [], "_count": {"workflows": 0}}
            ])
        );
    }

    #[test]
    fn find_first_reads_one_row_in_the_requested_direction() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        for (take, expected) in [(json!(5), 1), (json!(-3), -1)] {
            let plan = plan(&registry, &config, "User", Operation::FindFirst, &json!({"take": take})).unwrap();
            let Statement::Find { window, .. } = &plan.batch.statements[0] else {
                panic!("expected a find");
            };
            assert_eq!(window.take, Some(expected));
        }
    }
}
