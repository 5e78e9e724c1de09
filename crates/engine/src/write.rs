//! Write Planner: create, update, upsert and delete operations, including
//! nested relation writes.
//!
//! Every write is one atomic batch. Statements that produce rows other
//! statements depend on come first; dependents copy keys from them through
//! [`Link`]s or select them through [`Filter::Step`].

use rust_decimal::Decimal;
use schema::{Cardinality, Entity, Field, FieldDefault, Relation, RelationLink, ScalarKind, Value};
use serde_json::Value as Json;
use storage::{
    AssignOp, Assignment, Filter, JsonTarget, Link, OrderBy, Quantifier, Record, RelationFilter, Statement, Window,
};
use uuid::Uuid;

use crate::descriptor::{
    parse_args, CreateArgs, CreateManyArgs, DeleteManyArgs, UniqueArgs, UpdateArgs, UpdateManyArgs, UpsertArgs,
};
use crate::filter::null_sentinel;
use crate::order::{single_key, tiebreak};
use crate::plan::{at, BatchBuilder, Finish, Planner};
use crate::projection::Shape;
use crate::query::ScopedRead;
use crate::QueryError;

/// Key columns a nested child copies from the row its parent statement wrote.
struct ParentLink {
    link: Link,
    /// The child's relation pointing back at the parent.
    back: String,
}

/// Result of a nested write on an owned relation.
enum OwnedWrite {
    Link(Link),
    /// `disconnect`: clear these foreign key fields.
    Clear(Vec<String>),
}

/// An inverse-relation payload, planned once its parent statement exists.
struct Deferred<'a> {
    relation: &'a Relation,
    payload: &'a Json,
    path: String,
}

struct UpdateParts<'a> {
    assignments: Vec<Assignment>,
    links: Vec<Link>,
    deferred: Vec<Deferred<'a>>,
}

impl Planner<'_> {
    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub(crate) fn create(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: CreateArgs = parse_args(&entity.name, "args", args)?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let step = self.insert_one(batch, entity, &args.data, "data", 1, None)?;
        Ok(self.read_back(batch, step, &shape))
    }

    pub(crate) fn create_many(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        args: &Json,
        returning: bool,
    ) -> Result<Finish, QueryError> {
        let args: CreateManyArgs = parse_args(&entity.name, "args", args)?;
        let shape = self.returning_shape(entity, returning, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref())?;
        let rows = match &args.data {
            Json::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.scalar_row(entity, item, &format!("data[{i}]"), &[]))
                .collect::<Result<Vec<_>, _>>()?,
            Json::Object(_) => vec![self.scalar_row(entity, &args.data, "data", &[])?],
            _ => return Err(QueryError::validation(&entity.name, "data", "expected an object or a list of objects")),
        };
        let step = batch.push(Statement::Insert {
            entity: entity.name.clone(),
            rows,
            links: Vec::new(),
            skip_duplicates: args.skip_duplicates,
        });
        Ok(match shape {
            Some(shape) => self.read_back_all(batch, entity, step, &shape),
            None => Finish::Affected { step },
        })
    }

    pub(crate) fn update(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: UpdateArgs = parse_args(&entity.name, "args", args)?;
        let unique = self.parse_unique(entity, &args.filter, "where", false)?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let parts = self.update_parts(batch, entity, &args.data, "data", true)?;
        let step = batch.push(Statement::Update {
            entity: entity.name.clone(),
            filter: unique.to_filter(),
            order: Vec::new(),
            limit: None,
            assignments: parts.assignments,
            links: parts.links,
            required: true,
        });
        for deferred in parts.deferred {
            self.inverse_nested(batch, entity, step, &deferred, 1, true)?;
        }
        Ok(self.read_back(batch, step, &shape))
    }

    pub(crate) fn update_many(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        args: &Json,
        returning: bool,
    ) -> Result<Finish, QueryError> {
        let args: UpdateManyArgs = parse_args(&entity.name, "args", args)?;
        let shape = self.returning_shape(entity, returning, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref())?;
        let filter = match &args.filter {
            Some(json) => self.parse_filter(entity, json, "where")?,
            None => Filter::all(),
        };
        let parts = self.update_parts(batch, entity, &args.data, "data", false)?;
        let (order, limit) = self.limit(entity, args.limit)?;
        let step = batch.push(Statement::Update {
            entity: entity.name.clone(),
            filter,
            order,
            limit,
            assignments: parts.assignments,
            links: parts.links,
            required: false,
        });
        Ok(match shape {
            Some(shape) => self.read_back_all(batch, entity, step, &shape),
            None => Finish::Affected { step },
        })
    }

    pub(crate) fn upsert(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: UpsertArgs = parse_args(&entity.name, "args", args)?;
        let unique = self.parse_unique(entity, &args.filter, "where", false)?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let create = self.scalar_row(entity, &args.create, "create", &[])?;
        let parts = self.update_parts(batch, entity, &args.update, "update", false)?;
        let step = batch.push(Statement::Upsert {
            entity: entity.name.clone(),
            filter: unique.to_filter(),
            create,
            update: parts.assignments,
        });
        Ok(self.read_back(batch, step, &shape))
    }

    /// Reads the row first so the caller gets it back after it is gone.
    pub(crate) fn delete(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: UniqueArgs = parse_args(&entity.name, "args", args)?;
        let unique = self.parse_unique(entity, &args.filter, "where", false)?;
        let shape = self.shape(entity, args.select.as_ref(), args.include.as_ref(), args.omit.as_ref(), "", 1)?;
        let filter = unique.to_filter();
        let read = ScopedRead {
            filter: filter.clone(),
            ..ScopedRead::default()
        };
        let (step, assembly) = self.plan_read(batch, read, &shape);
        batch.push(Statement::Delete {
            entity: entity.name.clone(),
            filter,
            order: Vec::new(),
            limit: None,
            required: true,
        });
        Ok(Finish::Row {
            step,
            assembly,
            required: true,
        })
    }

    pub(crate) fn delete_many(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: DeleteManyArgs = parse_args(&entity.name, "args", args)?;
        let filter = match &args.filter {
            Some(json) => self.parse_filter(entity, json, "where")?,
            None => Filter::all(),
        };
        let (order, limit) = self.limit(entity, args.limit)?;
        let step = batch.push(Statement::Delete {
            entity: entity.name.clone(),
            filter,
            order,
            limit,
            required: false,
        });
        Ok(Finish::Affected { step })
    }

    // -----------------------------------------------------------------------
    // Read-back
    // -----------------------------------------------------------------------

    fn read_back(&self, batch: &mut BatchBuilder, step: usize, shape: &Shape) -> Finish {
        let read = ScopedRead {
            filter: Filter::Step(step),
            ..ScopedRead::default()
        };
        let (step, assembly) = self.plan_read(batch, read, shape);
        Finish::Row {
            step,
            assembly,
            required: true,
        }
    }

    fn read_back_all(&self, batch: &mut BatchBuilder, entity: &Entity, step: usize, shape: &Shape) -> Finish {
        let read = ScopedRead {
            filter: Filter::Step(step),
            order: tiebreak(entity, Vec::new()),
            window: Window::default(),
        };
        let (step, assembly) = self.plan_read(batch, read, shape);
        Finish::Rows { step, assembly }
    }

    /// The shape of an `...AndReturn` variant; the plain variants take no projection.
    fn returning_shape(
        &self,
        entity: &Entity,
        returning: bool,
        select: Option<&Json>,
        include: Option<&Json>,
        omit: Option<&Json>,
    ) -> Result<Option<Shape>, QueryError> {
        if returning {
            return self.shape(entity, select, include, omit, "", 1).map(Some);
        }
        let given = [("select", select), ("include", include), ("omit", omit)]
            .into_iter()
            .find(|(_, value)| value.is_some());
        match given {
            Some((key, _)) => Err(QueryError::validation(
                &entity.name,
                key,
                "only the ...AndReturn variant returns rows",
            )),
            None => Ok(None),
        }
    }

    /// `limit` applies in ascending identity order.
    fn limit(&self, entity: &Entity, limit: Option<i64>) -> Result<(Vec<OrderBy>, Option<u64>), QueryError> {
        match limit {
            None => Ok((Vec::new(), None)),
            Some(n) => {
                let n = u64::try_from(n)
                    .map_err(|_| QueryError::validation(&entity.name, "limit", "limit must not be negative"))?;
                Ok((tiebreak(entity, Vec::new()), Some(n)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rows
    // -----------------------------------------------------------------------

    /// Push the `Insert` of one row with its nested writes; returns its step.
    fn insert_one(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        data: &Json,
        path: &str,
        depth: usize,
        parent: Option<ParentLink>,
    ) -> Result<usize, QueryError> {
        self.check_depth(entity, path, depth)?;
        let map = data
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected an object"))?;

        let mut row = Record::new();
        let mut links = Vec::new();
        let mut linked: Vec<String> = Vec::new();
        let mut deferred = Vec::new();
        if let Some(parent) = parent {
            if map.contains_key(&parent.back) {
                return Err(QueryError::validation(
                    &entity.name,
                    &at(path, &parent.back),
                    format!("'{}' is set by the enclosing write", parent.back),
                ));
            }
            linked.extend(parent.link.pairs.iter().map(|(local, _)| local.clone()));
            links.push(parent.link);
        }

        for (key, value) in map {
            let here = at(path, key);
            if let Some(field) = entity.field(key) {
                row.insert(key.clone(), self.write_value(entity, field, value, &here)?);
            } else if let Some(relation) = entity.relation(key) {
                if relation.is_owned() {
                    match self.owned_nested(batch, entity, relation, value, &here, depth, false)? {
                        OwnedWrite::Link(link) => {
                            linked.extend(link.pairs.iter().map(|(local, _)| local.clone()));
                            links.push(link);
                        }
                        OwnedWrite::Clear(_) => {}
                    }
                } else {
                    deferred.push(Deferred {
                        relation,
                        payload: value,
                        path: here,
                    });
                }
            } else {
                return Err(unknown_member(entity, key, &here));
            }
        }

        reject_linked_fields(entity, &linked, |f| row.contains_key(f), path)?;
        self.fill_defaults(entity, &mut row, &linked, path)?;
        let step = batch.push(Statement::Insert {
            entity: entity.name.clone(),
            rows: vec![row],
            links,
            skip_duplicates: false,
        });
        for deferred in &deferred {
            self.inverse_nested(batch, entity, step, deferred, depth, false)?;
        }
        Ok(step)
    }

    /// A row of scalar fields only, with defaults applied.
    fn scalar_row(&self, entity: &Entity, data: &Json, path: &str, linked: &[String]) -> Result<Record, QueryError> {
        let map = data
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected an object"))?;
        let mut row = Record::new();
        for (key, value) in map {
            let here = at(path, key);
            if let Some(field) = entity.field(key) {
                row.insert(key.clone(), self.write_value(entity, field, value, &here)?);
            } else if entity.relation(key).is_some() {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("relation '{key}' cannot be written here; only scalar fields are accepted"),
                ));
            } else {
                return Err(unknown_member(entity, key, &here));
            }
        }
        reject_linked_fields(entity, linked, |f| row.contains_key(f), path)?;
        self.fill_defaults(entity, &mut row, linked, path)?;
        Ok(row)
    }

    fn fill_defaults(&self, entity: &Entity, row: &mut Record, linked: &[String], path: &str) -> Result<(), QueryError> {
        for field in &entity.fields {
            if row.contains_key(&field.name) || linked.contains(&field.name) {
                continue;
            }
            let value = if field.updated_at {
                Value::DateTime(self.now)
            } else if let Some(default) = &field.default {
                match default {
                    FieldDefault::Uuid => Value::String(Uuid::new_v4().to_string()),
                    FieldDefault::Now => Value::DateTime(self.now),
                    FieldDefault::Value(value) => value.clone(),
                }
            } else if field.list {
                Value::List(Vec::new())
            } else if field.nullable {
                Value::Null
            } else {
                return Err(QueryError::validation(
                    &entity.name,
                    path,
                    format!("missing required field '{}'", field.name),
                ));
            };
            row.insert(field.name.clone(), value);
        }
        Ok(())
    }

    /// Convert a written value; `null` only for nullable fields.
    fn write_value(&self, entity: &Entity, field: &Field, json: &Json, path: &str) -> Result<Value, QueryError> {
        if field.kind == ScalarKind::Json {
            if json.is_null() {
                return Err(QueryError::validation(
                    &entity.name,
                    path,
                    "null is ambiguous for JSON fields; use {\"$null\": \"db\"} or {\"$null\": \"json\"}",
                ));
            }
            return match null_sentinel(&entity.name, json, path)? {
                None => Ok(Value::Json(json.clone())),
                Some(JsonTarget::JsonNull) => Ok(Value::Json(Json::Null)),
                Some(JsonTarget::DbNull) if field.nullable => Ok(Value::Null),
                Some(JsonTarget::DbNull) => Err(not_nullable(entity, field, path)),
                Some(_) => Err(QueryError::validation(
                    &entity.name,
                    path,
                    "{\"$null\": \"any\"} is only valid in filters",
                )),
            };
        }
        if json.is_null() && !field.nullable {
            return Err(not_nullable(entity, field, path));
        }
        self.registry
            .parse_value(field, json)
            .map_err(|e| QueryError::validation(&entity.name, path, e.to_string()))
    }

    /// `updatedAt` fields set to the plan's timestamp.
    fn touch(&self, entity: &Entity) -> Vec<Assignment> {
        entity
            .fields
            .iter()
            .filter(|f| f.updated_at)
            .map(|f| Assignment::set(f.name.clone(), Value::DateTime(self.now)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Assignments, links and deferred inverse writes of an update payload.
    /// Without `nested`, relation keys are rejected.
    fn update_parts<'e>(
        &self,
        batch: &mut BatchBuilder,
        entity: &'e Entity,
        data: &'e Json,
        path: &str,
        nested: bool,
    ) -> Result<UpdateParts<'e>, QueryError> {
        let map = data
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected an object"))?;
        let mut parts = UpdateParts {
            assignments: Vec::new(),
            links: Vec::new(),
            deferred: Vec::new(),
        };
        let mut linked: Vec<String> = Vec::new();

        for (key, value) in map {
            let here = at(path, key);
            if let Some(field) = entity.field(key) {
                parts.assignments.push(self.assignment(entity, field, value, &here)?);
            } else if let Some(relation) = entity.relation(key) {
                if !nested {
                    return Err(QueryError::validation(
                        &entity.name,
                        &here,
                        format!("relation '{key}' cannot be written here; only scalar fields are accepted"),
                    ));
                }
                if relation.is_owned() {
                    match self.owned_nested(batch, entity, relation, value, &here, 1, true)? {
                        OwnedWrite::Link(link) => {
                            linked.extend(link.pairs.iter().map(|(local, _)| local.clone()));
                            parts.links.push(link);
                        }
                        OwnedWrite::Clear(fields) => {
                            for field in fields {
                                parts.assignments.push(Assignment::set(field.clone(), Value::Null));
                                linked.push(field);
                            }
                        }
                    }
                } else {
                    parts.deferred.push(Deferred {
                        relation,
                        payload: value,
                        path: here,
                    });
                }
            } else {
                return Err(unknown_member(entity, key, &here));
            }
        }

        reject_linked_fields(entity, &linked, |f| map.contains_key(f), path)?;
        for touched in self.touch(entity) {
            if !map.contains_key(&touched.field) {
                parts.assignments.push(touched);
            }
        }
        Ok(parts)
    }

    /// A plain value sets the field; an object holds one atomic operation.
    fn assignment(&self, entity: &Entity, field: &Field, json: &Json, path: &str) -> Result<Assignment, QueryError> {
        if field.kind == ScalarKind::Json || !json.is_object() {
            return Ok(Assignment::set(field.name.clone(), self.write_value(entity, field, json, path)?));
        }
        let (here, name, operand) = single_key(&entity.name, json, path)?;
        let op = match name.as_str() {
            "set" => AssignOp::Set(self.write_value(entity, field, operand, &here)?),
            "increment" | "decrement" | "multiply" | "divide" if field.is_numeric() => {
                let value = self.element(&entity.name, &field.kind, operand, &here)?;
                match name.as_str() {
                    "increment" => AssignOp::Increment(value),
                    "decrement" => AssignOp::Decrement(value),
                    "multiply" => AssignOp::Multiply(value),
                    _ if is_zero(&value) => {
                        return Err(QueryError::validation(&entity.name, &here, "division by zero"))
                    }
                    _ => AssignOp::Divide(value),
                }
            }
            "push" if field.list => match operand {
                Json::Array(items) => AssignOp::Push(Value::List(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| self.element(&entity.name, &field.kind, item, &format!("{here}[{i}]")))
                        .collect::<Result<_, _>>()?,
                )),
                _ => AssignOp::Push(self.element(&entity.name, &field.kind, operand, &here)?),
            },
            other => {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("'{other}' is not a valid update of {} field '{}'", field.kind.label(), field.name),
                ))
            }
        };
        Ok(Assignment {
            field: field.name.clone(),
            op,
        })
    }

    // -----------------------------------------------------------------------
    // Nested relation writes
    // -----------------------------------------------------------------------

    /// `create` / `connect` (and in updates `disconnect`) on a relation whose
    /// foreign key lives on `entity`.
    #[allow(clippy::too_many_arguments)]
    fn owned_nested(
        &self,
        batch: &mut BatchBuilder,
        entity: &Entity,
        relation: &Relation,
        value: &Json,
        path: &str,
        depth: usize,
        updating: bool,
    ) -> Result<OwnedWrite, QueryError> {
        let RelationLink::Owned { fields, references, .. } = &relation.link else {
            return Err(QueryError::validation(&entity.name, path, "expected an owned relation"));
        };
        let target = self.target(entity, relation, path)?;
        let (here, op, operand) = single_key(&entity.name, value, path)?;
        let step = match op.as_str() {
            "create" => self.insert_one(batch, target, operand, &here, depth + 1, None)?,
            "connect" => {
                let unique = self.parse_unique(target, operand, &here, true)?;
                batch.push(Statement::Find {
                    entity: target.name.clone(),
                    filter: unique.to_filter(),
                    order: Vec::new(),
                    window: Window {
                        take: Some(1),
                        ..Window::default()
                    },
                })
            }
            "disconnect" if updating => {
                if !self.registry.is_optional(entity, relation) {
                    return Err(QueryError::validation(
                        &entity.name,
                        &here,
                        format!("required relation '{}' cannot be disconnected", relation.name),
                    ));
                }
                if *operand != Json::Bool(true) {
                    return Err(QueryError::validation(&entity.name, &here, "disconnect takes true"));
                }
                return Ok(OwnedWrite::Clear(fields.clone()));
            }
            other => {
                let allowed = if updating { "create, connect or disconnect" } else { "create or connect" };
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("'{other}' is not a nested write of '{}'; use {allowed}", relation.name),
                ));
            }
        };
        Ok(OwnedWrite::Link(Link {
            step,
            target: target.name.clone(),
            pairs: fields.iter().cloned().zip(references.iter().cloned()).collect(),
        }))
    }

    /// Writes on a relation whose foreign key lives on the related rows; they
    /// copy the key of the row written by `parent_step`.
    fn inverse_nested(
        &self,
        batch: &mut BatchBuilder,
        parent: &Entity,
        parent_step: usize,
        deferred: &Deferred<'_>,
        depth: usize,
        updating: bool,
    ) -> Result<(), QueryError> {
        let Deferred { relation, payload, path } = deferred;
        let path = path.as_str();
        let target = self.target(parent, relation, path)?;
        let back = match &relation.link {
            RelationLink::Inverse { inverse } => target.relation(inverse),
            RelationLink::Owned { .. } => None,
        }
        .ok_or_else(|| QueryError::validation(&parent.name, path, "expected an inverse relation"))?;
        let RelationLink::Owned { fields, references, .. } = &back.link else {
            return Err(QueryError::validation(&parent.name, path, "expected an inverse relation"));
        };
        let link = Link {
            step: parent_step,
            target: parent.name.clone(),
            pairs: fields.iter().cloned().zip(references.iter().cloned()).collect(),
        };
        let to_many = relation.cardinality == Cardinality::Many;
        let map = payload
            .as_object()
            .ok_or_else(|| QueryError::validation(&parent.name, path, "expected an object of nested writes"))?;
        let of_parent = Filter::Relation(RelationFilter {
            join: self.join(target, back, path)?,
            quantifier: Quantifier::Some,
            filter: Box::new(Filter::Step(parent_step)),
        });

        // Removals run before additions so `{deleteMany: {}, create: [...]}` replaces the set.
        let mut ops: Vec<(&String, &Json)> = map.iter().collect();
        ops.sort_by_key(|(op, _)| !matches!(op.as_str(), "deleteMany" | "disconnect"));

        for (op, operand) in ops {
            let here = at(path, op);
            match op.as_str() {
                "create" => {
                    for (item, item_path) in items(&parent.name, operand, &here, to_many)? {
                        let parent_link = ParentLink {
                            link: link.clone(),
                            back: back.name.clone(),
                        };
                        self.insert_one(batch, target, item, &item_path, depth + 1, Some(parent_link))?;
                    }
                }
                "createMany" if to_many => {
                    let args = operand
                        .as_object()
                        .ok_or_else(|| QueryError::validation(&parent.name, &here, "expected {data, skipDuplicates}"))?;
                    if let Some(extra) = args.keys().find(|k| *k != "data" && *k != "skipDuplicates") {
                        return Err(QueryError::validation(
                            &parent.name,
                            &at(&here, extra),
                            format!("unknown createMany option '{extra}'"),
                        ));
                    }
                    let skip_duplicates = match args.get("skipDuplicates") {
                        None => false,
                        Some(flag) => flag.as_bool().ok_or_else(|| {
                            QueryError::validation(&parent.name, &at(&here, "skipDuplicates"), "expected a boolean")
                        })?,
                    };
                    let data = args
                        .get("data")
                        .ok_or_else(|| QueryError::validation(&parent.name, &here, "missing 'data'"))?;
                    let rows = items(&parent.name, data, &at(&here, "data"), true)?
                        .into_iter()
                        .map(|(item, item_path)| self.scalar_row(target, item, &item_path, fields))
                        .collect::<Result<Vec<_>, _>>()?;
                    batch.push(Statement::Insert {
                        entity: target.name.clone(),
                        rows,
                        links: vec![link.clone()],
                        skip_duplicates,
                    });
                }
                "connect" => {
                    for (item, item_path) in items(&parent.name, operand, &here, to_many)? {
                        let unique = self.parse_unique(target, item, &item_path, true)?;
                        batch.push(Statement::Update {
                            entity: target.name.clone(),
                            filter: unique.to_filter(),
                            order: Vec::new(),
                            limit: None,
                            assignments: self.touch(target),
                            links: vec![link.clone()],
                            required: true,
                        });
                    }
                }
                "disconnect" if updating => {
                    if !fields.iter().all(|f| target.field(f).map_or(false, |field| field.nullable)) {
                        return Err(QueryError::validation(
                            &parent.name,
                            &here,
                            format!("{}.{} is required; its rows cannot be disconnected", target.name, back.name),
                        ));
                    }
                    let selectors = if to_many {
                        items(&parent.name, operand, &here, true)?
                            .into_iter()
                            .map(|(item, item_path)| {
                                self.parse_unique(target, item, &item_path, true).map(|u| u.to_filter())
                            })
                            .collect::<Result<Vec<_>, _>>()?
                    } else if *operand == Json::Bool(true) {
                        vec![Filter::all()]
                    } else {
                        return Err(QueryError::validation(&parent.name, &here, "disconnect takes true"));
                    };
                    let mut assignments: Vec<Assignment> =
                        fields.iter().map(|f| Assignment::set(f.clone(), Value::Null)).collect();
                    assignments.extend(self.touch(target));
                    for selector in selectors {
                        batch.push(Statement::Update {
                            entity: target.name.clone(),
                            filter: Filter::and(vec![selector, of_parent.clone()]),
                            order: Vec::new(),
                            limit: None,
                            assignments: assignments.clone(),
                            links: Vec::new(),
                            required: false,
                        });
                    }
                }
                "deleteMany" if to_many && updating => {
                    // A list deletes the children matching any of its filters.
                    let selector = match operand {
                        Json::Array(list) => Filter::Or(
                            list.iter()
                                .enumerate()
                                .map(|(i, item)| self.parse_filter(target, item, &format!("{here}[{i}]")))
                                .collect::<Result<Vec<_>, _>>()?,
                        ),
                        _ => self.parse_filter(target, operand, &here)?,
                    };
                    batch.push(Statement::Delete {
                        entity: target.name.clone(),
                        filter: Filter::and(vec![of_parent.clone(), selector]),
                        order: Vec::new(),
                        limit: None,
                        required: false,
                    });
                }
                other => {
                    let allowed = match (to_many, updating) {
                        (true, true) => "create, createMany, connect, disconnect or deleteMany",
                        (true, false) => "create, createMany or connect",
                        (false, true) => "create, connect or disconnect",
                        (false, false) => "create or connect",
                    };
                    return Err(QueryError::validation(
                        &parent.name,
                        &here,
                        format!("'{other}' is not a nested write of '{}'; use {allowed}", relation.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One object, or for to-many relations a list of them, with their paths.
fn items<'j>(entity: &str, json: &'j Json, path: &str, many: bool) -> Result<Vec<(&'j Json, String)>, QueryError> {
    match json {
        Json::Array(list) if many => Ok(list.iter().enumerate().map(|(i, item)| (item, format!("{path}[{i}]"))).collect()),
        Json::Array(_) => Err(QueryError::validation(entity, path, "a to-one relation takes a single object")),
        Json::Object(_) => Ok(vec![(json, path.to_owned())]),
        _ => Err(QueryError::validation(entity, path, "expected an object")),
    }
}

/// Foreign keys filled through a relation may not also be written directly.
fn reject_linked_fields(
    entity: &Entity,
    linked: &[String],
    given: impl Fn(&str) -> bool,
    path: &str,
) -> Result<(), QueryError> {
    match linked.iter().find(|f| given(f.as_str())) {
        Some(field) => Err(QueryError::validation(
            &entity.name,
            &at(path, field),
            format!("'{field}' is written through its relation"),
        )),
        None => Ok(()),
    }
}

fn unknown_member(entity: &Entity, key: &str, path: &str) -> QueryError {
    QueryError::validation(
        &entity.name,
        path,
        format!("unknown field or relation '{key}' on {}", entity.name),
    )
}

fn not_nullable(entity: &Entity, field: &Field, path: &str) -> QueryError {
    QueryError::validation(&entity.name, path, format!("field '{}' is not nullable", field.name))
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Int(n) => *n == 0,
        Value::Float(f) => *f == 0.0,
        Value::Decimal(d) => *d == Decimal::ZERO,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{plan, ClientConfig, Operation};
    use schema::platform::platform_registry;
    use serde_json::json;

    fn validation_path(result: Result<crate::Plan, QueryError>) -> String {
        match result {
            Err(QueryError::Validation { path, .. }) => path,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::Create,
            &json!({"data": {"clerkId": "c1", "email": "a@x.com"}}),
        )
        .unwrap();
        let Statement::Insert { rows, .. } = &plan.batch.statements[0] else {
            panic!("expected an insert");
        };
        let row = &rows[0];
        assert!(matches!(&row["id"], Value::String(id) if Uuid::parse_str(id).is_ok()));
        assert_eq!(row["name"], Value::Null);
        assert!(matches!(row["updatedAt"], Value::DateTime(_)));
        assert!(plan.batch.atomic);
    }

    #[test]
    fn missing_required_fields_fail_validation() {
        let registry = platform_registry().unwrap();
        let err = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::Create,
            &json!({"data": {"clerkId": "c1"}}),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::Validation { message, .. } if message.contains("'email'")));
    }

    #[test]
    fn nested_connect_links_the_foreign_key() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "Workflow",
            Operation::Create,
            &json!({"data": {"name": "w", "eventName": "e", "user": {"connect": {"email": "a@x.com"}}}}),
        )
        .unwrap();
        assert!(matches!(&plan.batch.statements[0], Statement::Find { entity, .. } if entity == "User"));
        let Statement::Insert { links, rows, .. } = &plan.batch.statements[1] else {
            panic!("expected an insert");
        };
        assert_eq!(links[0].pairs, vec![("userId".to_string(), "id".to_string())]);
        assert!(!rows[0].contains_key("userId"));
    }

    #[test]
    fn foreign_keys_cannot_be_set_twice() {
        let registry = platform_registry().unwrap();
        let result = plan(
            &registry,
            &ClientConfig::default(),
            "Workflow",
            Operation::Create,
            &json!({"data": {"name": "w", "eventName": "e", "userId": "u1", "user": {"connect": {"id": "u1"}}}}),
        );
        assert_eq!(validation_path(result), "data.userId");
    }

    #[test]
    fn update_operations_follow_field_kinds() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let update = |data: Json| {
            plan(
                &registry,
                &config,
                "AutomationMetrics",
                Operation::UpdateMany,
                &json!({"data": data}),
            )
        };
        let plan = update(json!({"runsCount": {"increment": 1}})).unwrap();
        let Statement::Update { assignments, .. } = &plan.batch.statements[0] else {
            panic!("expected an update");
        };
        assert_eq!(assignments[0].op, AssignOp::Increment(Value::Int(1)));

        assert_eq!(validation_path(update(json!({"runsCount": {"divide": 0}}))), "data.runsCount.divide");
        assert_eq!(validation_path(update(json!({"workflowId": {"increment": 1}}))), "data.workflowId.increment");
        assert_eq!(validation_path(update(json!({"workflow": {"connect": {"id": "w1"}}}))), "data.workflow");
    }

    #[test]
    fn json_writes_need_an_explicit_null_state() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let create = |output: Json| {
            plan(
                &registry,
                &config,
                "WorkflowRun",
                Operation::CreateMany,
                &json!({"data": [{"workflowId": "w1", "userId": "u1", "inngestRunId": "i1", "output": output}]}),
            )
        };
        assert_eq!(validation_path(create(Json::Null)), "data[0].output");
        let plan = create(json!({"$null": "json"})).unwrap();
        let Statement::Insert { rows, .. } = &plan.batch.statements[0] else {
            panic!("expected an insert");
        };
        assert_eq!(rows[0]["output"], Value::Json(Json::Null));
        assert_eq!(rows[0]["input"], Value::Null);
    }

    #[test]
    fn limits_apply_in_identity_order() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "Workflow",
            Operation::DeleteMany,
            &json!({"limit": 2}),
        )
        .unwrap();
        let Statement::Delete { order, limit, .. } = &plan.batch.statements[0] else {
            panic!("expected a delete");
        };
        assert_eq!(limit, &Some(2));
        assert_eq!(order, &vec![OrderBy::asc("id")]);

        let result = plan_with_negative_limit(&registry);
        assert_eq!(validation_path(result), "limit");
    }

    fn plan_with_negative_limit(registry: &schema::SchemaRegistry) -> Result<crate::Plan, QueryError> {
        plan(
            registry,
            &ClientConfig::default(),
            "Workflow",
            Operation::UpdateMany,
            &json!({"data": {"name": "x"}, "limit": -1}),
        )
    }

    #[test]
    fn plain_many_writes_take_no_projection() {
        let registry = platform_registry().unwrap();
        let result = plan(
            &registry,
            &ClientConfig::default(),
            "User",
            Operation::UpdateMany,
            &json!({"data": {"name": "x"}, "select": {"id": true}}),
        );
        assert_eq!(validation_path(result), "select");
    }

    #[test]
    fn delete_reads_before_it_deletes() {
        let registry = platform_registry().unwrap();
        let plan = plan(
            &registry,
            &ClientConfig::default(),
            "Credential",
            Operation::Delete,
            &json!({"where": {"userId_name": {"userId": "u1", "name": "gmail"}}}),
        )
        .unwrap();
        assert!(matches!(plan.batch.statements[0], Statement::Find { .. }));
        assert!(matches!(plan.batch.statements[1], Statement::Delete { required: true, .. }));
    }

    #[test]
    fn nested_delete_many_is_scoped_to_the_parent() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let plan = plan(
            &registry,
            &config,
            "Workflow",
            Operation::Update,
            &json!({"where": {"id": "w1"}, "data": {"credentials": {"deleteMany": {"credentialId": "cr1"}}}}),
        )
        .unwrap();
        let Statement::Delete { filter: Filter::And(parts), required: false, .. } = &plan.batch.statements[1] else {
            panic!("expected a scoped delete, got {:?}", plan.batch.statements[1]);
        };
        assert!(matches!(&parts[0], Filter::Relation(r) if *r.filter == Filter::Step(0)));

        let created = crate::plan(
            &registry,
            &config,
            "Workflow",
            Operation::Create,
            &json!({"data": {"userId": "u1", "name": "a", "eventName": "run", "credentials": {"deleteMany": {}}}}),
        );
        assert_eq!(validation_path(created), "data.credentials.deleteMany");
    }
}
