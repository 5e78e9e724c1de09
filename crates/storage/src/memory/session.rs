//! Statement execution against the locked tables of a [`MemoryStore`](super::MemoryStore).

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use schema::{Entity, ReferentialAction, RelationLink, SchemaRegistry, Value};
use tracing::debug;

use super::State;
use crate::eval::{field_value, project, Evaluator};
use crate::statement::{
    AssignOp, Assignment, Filter, Link, OrderBy, Outcome, Record, Statement, Tally, Window,
};
use crate::window::{self, Keyed};
use crate::StorageError;

pub(super) struct Session<'a> {
    registry: &'a SchemaRegistry,
    state: &'a mut State,
    steps: &'a [Outcome],
}

impl<'a> Session<'a> {
    pub(super) fn new(registry: &'a SchemaRegistry, state: &'a mut State, steps: &'a [Outcome]) -> Self {
        Self { registry, state, steps }
    }

    pub(super) fn run(&mut self, statement: &Statement) -> Result<Outcome, StorageError> {
        match statement {
            Statement::Find { entity, filter, order, window } => {
                Ok(Outcome::Rows(self.select(entity, filter, order, window)?))
            }
            Statement::Count { entity, filter, order, window } => {
                Ok(Outcome::Count(self.select(entity, filter, order, window)?.len() as u64))
            }
            Statement::Tally { entity, filter, by } => Ok(Outcome::Tallies(self.tally(entity, filter, by)?)),
            Statement::Insert { entity, rows, links, skip_duplicates } => {
                Ok(Outcome::Written(self.insert(entity, rows, links, *skip_duplicates)?))
            }
            Statement::Update { entity, filter, order, limit, assignments, links, required } => {
                let positions = self.positions(entity, filter, order, *limit)?;
                if positions.is_empty() && *required {
                    return Err(not_found(entity, "update"));
                }
                let entity = self.entity(entity)?;
                let mut written = Vec::with_capacity(positions.len());
                for position in positions {
                    written.push(self.update_at(entity, position, assignments, links)?);
                }
                Ok(Outcome::Written(written))
            }
            Statement::Upsert { entity, filter, create, update } => {
                let existing = self.positions(entity, filter, &[], Some(1))?;
                let entity = self.entity(entity)?;
                match existing.first() {
                    Some(&position) => {
                        let row = self.update_at(entity, position, update, &[])?;
                        self.state.stats.upsert_updates += 1;
                        Ok(Outcome::Upserted { created: false, row })
                    }
                    None => {
                        let row = self.insert_row(entity, create.clone(), &[])?;
                        self.state.stats.upsert_creates += 1;
                        Ok(Outcome::Upserted { created: true, row })
                    }
                }
            }
            Statement::Delete { entity, filter, order, limit, required } => {
                let positions = self.positions(entity, filter, order, *limit)?;
                if positions.is_empty() && *required {
                    return Err(not_found(entity, "delete"));
                }
                let entity = self.entity(entity)?;
                let table = self.table(&entity.name);
                let rows: Vec<Record> = positions.iter().map(|&p| table[p].clone()).collect();
                self.remove(entity, &rows)?;
                Ok(Outcome::Written(rows))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(self.registry, &self.state.tables, self.steps)
    }

    fn entity(&self, name: &str) -> Result<&'a Entity, StorageError> {
        let registry: &'a SchemaRegistry = self.registry;
        registry
            .entity(name)
            .map_err(|e| StorageError::InvalidStatement(e.to_string()))
    }

    fn table(&self, entity: &str) -> &[Record] {
        self.state.tables.get(entity).map_or(&[][..], Vec::as_slice)
    }

    /// Matching rows as `(position, sort keys)`, sorted.
    fn keyed(&self, entity: &str, filter: &Filter, order: &[OrderBy]) -> Result<Vec<(usize, Keyed)>, StorageError> {
        let eval = self.evaluator();
        let mut matched = Vec::new();
        for (position, row) in eval.rows(entity)?.iter().enumerate() {
            if eval.matches(entity, row, filter)? {
                let keys = eval.order_keys(row, order)?;
                matched.push((position, Keyed { keys, row: row.clone() }));
            }
        }
        if !order.is_empty() {
            matched.sort_by(|(_, a), (_, b)| window::compare_keys(&a.keys, &b.keys, order));
        }
        Ok(matched)
    }

    fn select(
        &self,
        entity: &str,
        filter: &Filter,
        order: &[OrderBy],
        window: &Window,
    ) -> Result<Vec<Record>, StorageError> {
        let rows = self.keyed(entity, filter, order)?.into_iter().map(|(_, k)| k.row).collect();
        Ok(window::apply(rows, window))
    }

    fn positions(
        &self,
        entity: &str,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
    ) -> Result<Vec<usize>, StorageError> {
        let matched = self.keyed(entity, filter, order)?;
        let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(matched.into_iter().take(limit).map(|(p, _)| p).collect())
    }

    fn tally(&self, entity: &str, filter: &Filter, by: &[String]) -> Result<Vec<Tally>, StorageError> {
        let mut tallies: Vec<Tally> = Vec::new();
        let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
        for (_, keyed) in self.keyed(entity, filter, &[])? {
            let key = project(&keyed.row, by);
            match index.get(&key) {
                Some(&slot) => tallies[slot].count += 1,
                None => {
                    index.insert(key.clone(), tallies.len());
                    tallies.push(Tally { key, count: 1 });
                }
            }
        }
        Ok(tallies)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn insert(
        &mut self,
        entity: &str,
        rows: &[Record],
        links: &[Link],
        skip_duplicates: bool,
    ) -> Result<Vec<Record>, StorageError> {
        let entity = self.entity(entity)?;
        let mut written = Vec::with_capacity(rows.len());
        for row in rows {
            match self.insert_row(entity, row.clone(), links) {
                Ok(row) => written.push(row),
                Err(StorageError::UniqueViolation { constraint, .. }) if skip_duplicates => {
                    debug!(entity = %entity.name, %constraint, "skipping duplicate row");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn insert_row(&mut self, entity: &Entity, mut row: Record, links: &[Link]) -> Result<Record, StorageError> {
        self.apply_links(&mut row, links)?;
        self.check_unique(entity, &row, None)?;
        self.check_references(entity, &row, None)?;
        self.state
            .tables
            .entry(entity.name.clone())
            .or_default()
            .push(row.clone());
        self.state.stats.inserted += 1;
        Ok(row)
    }

    fn update_at(
        &mut self,
        entity: &Entity,
        position: usize,
        assignments: &[Assignment],
        links: &[Link],
    ) -> Result<Record, StorageError> {
        let before = self.table(&entity.name)[position].clone();
        let mut after = before.clone();
        for assignment in assignments {
            let current = field_value(&after, &assignment.field);
            let next = assign(current, &assignment.op)?;
            after.insert(assignment.field.clone(), next);
        }
        self.apply_links(&mut after, links)?;

        self.check_unique(entity, &after, Some(position))?;
        self.check_references(entity, &after, Some(&before))?;
        self.check_key_change(entity, &before, &after)?;

        if let Some(table) = self.state.tables.get_mut(&entity.name) {
            table[position] = after.clone();
        }
        self.state.stats.updated += 1;
        Ok(after)
    }

    /// Delete `rows` and apply the on-delete action of every dependent relation.
    fn remove(&mut self, entity: &Entity, rows: &[Record]) -> Result<(), StorageError> {
        let identity = &entity.identity.fields;
        let doomed: HashSet<Vec<Value>> = rows.iter().map(|r| project(r, identity)).collect();
        if let Some(table) = self.state.tables.get_mut(&entity.name) {
            let before = table.len();
            table.retain(|row| !doomed.contains(&project(row, identity)));
            self.state.stats.deleted += (before - table.len()) as u64;
        }

        let registry: &'a SchemaRegistry = self.registry;
        for (dependent, relation) in registry.dependents(&entity.name) {
            let RelationLink::Owned { fields, references, on_delete } = &relation.link else {
                continue;
            };
            let referenced: HashSet<Vec<Value>> = rows
                .iter()
                .map(|r| project(r, references))
                .filter(|key| !key.iter().any(Value::is_null))
                .collect();
            let hits: Vec<usize> = self
                .table(&dependent.name)
                .iter()
                .enumerate()
                .filter(|(_, row)| referenced.contains(&project(row, fields)))
                .map(|(position, _)| position)
                .collect();
            if hits.is_empty() {
                continue;
            }

            match on_delete.unwrap_or(ReferentialAction::Restrict) {
                ReferentialAction::Restrict => {
                    return Err(StorageError::ForeignKeyViolation {
                        entity: dependent.name.clone(),
                        relation: relation.name.clone(),
                        target: entity.name.clone(),
                    })
                }
                ReferentialAction::SetNull => {
                    if let Some(table) = self.state.tables.get_mut(&dependent.name) {
                        for &position in &hits {
                            for field in fields {
                                table[position].insert(field.clone(), Value::Null);
                            }
                        }
                    }
                    self.state.stats.updated += hits.len() as u64;
                }
                ReferentialAction::Cascade => {
                    let table = self.table(&dependent.name);
                    let cascaded: Vec<Record> = hits.iter().map(|&p| table[p].clone()).collect();
                    debug!(entity = %dependent.name, rows = cascaded.len(), "cascading delete");
                    self.remove(dependent, &cascaded)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Constraints
    // -----------------------------------------------------------------------

    fn apply_links(&self, row: &mut Record, links: &[Link]) -> Result<(), StorageError> {
        for link in links {
            let outcome = self
                .steps
                .get(link.step)
                .ok_or_else(|| StorageError::InvalidStatement(format!("link to unexecuted step {}", link.step)))?;
            let source = outcome
                .rows()
                .first()
                .ok_or_else(|| not_found(&link.target, "connect"))?;
            for (local, from) in &link.pairs {
                row.insert(local.clone(), field_value(source, from).clone());
            }
        }
        Ok(())
    }

    /// Unique constraints ignore rows where any member is NULL.
    fn check_unique(&self, entity: &Entity, row: &Record, skip: Option<usize>) -> Result<(), StorageError> {
        let table = self.table(&entity.name);
        for constraint in entity.unique_constraints() {
            let key = project(row, &constraint.fields);
            if key.iter().any(Value::is_null) {
                continue;
            }
            let taken = table
                .iter()
                .enumerate()
                .any(|(position, other)| Some(position) != skip && project(other, &constraint.fields) == key);
            if taken {
                return Err(StorageError::UniqueViolation {
                    entity: entity.name.clone(),
                    constraint: constraint.name.clone(),
                    fields: constraint.fields.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every non-NULL foreign key must reference an existing row.
    fn check_references(&self, entity: &Entity, row: &Record, before: Option<&Record>) -> Result<(), StorageError> {
        for relation in &entity.relations {
            let RelationLink::Owned { fields, references, .. } = &relation.link else {
                continue;
            };
            let key = project(row, fields);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if before.map_or(false, |b| project(b, fields) == key) {
                continue;
            }
            let exists = self
                .table(&relation.target)
                .iter()
                .any(|target| project(target, references) == key);
            if !exists {
                return Err(StorageError::ForeignKeyViolation {
                    entity: entity.name.clone(),
                    relation: relation.name.clone(),
                    target: relation.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// A referenced key cannot change while dependents still point at it.
    fn check_key_change(&self, entity: &Entity, before: &Record, after: &Record) -> Result<(), StorageError> {
        let registry: &'a SchemaRegistry = self.registry;
        for (dependent, relation) in registry.dependents(&entity.name) {
            let RelationLink::Owned { fields, references, .. } = &relation.link else {
                continue;
            };
            let old = project(before, references);
            if old == project(after, references) || old.iter().any(Value::is_null) {
                continue;
            }
            let referenced = self
                .table(&dependent.name)
                .iter()
                .any(|row| project(row, fields) == old);
            if referenced {
                return Err(StorageError::ForeignKeyViolation {
                    entity: dependent.name.clone(),
                    relation: relation.name.clone(),
                    target: entity.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn not_found(entity: &str, operation: &str) -> StorageError {
    StorageError::RecordNotFound {
        entity: entity.to_owned(),
        operation: operation.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

fn assign(current: &Value, op: &AssignOp) -> Result<Value, StorageError> {
    match op {
        AssignOp::Set(value) => Ok(value.clone()),
        AssignOp::Increment(by) => arithmetic(current, by, Arith::Add),
        AssignOp::Decrement(by) => arithmetic(current, by, Arith::Sub),
        AssignOp::Multiply(by) => arithmetic(current, by, Arith::Mul),
        AssignOp::Divide(by) => arithmetic(current, by, Arith::Div),
        AssignOp::Push(value) => {
            let mut items = match current {
                Value::List(items) => items.clone(),
                Value::Null => Vec::new(),
                other => {
                    return Err(StorageError::InvalidStatement(format!("cannot push onto {other:?}")));
                }
            };
            match value {
                Value::List(more) => items.extend(more.iter().cloned()),
                single => items.push(single.clone()),
            }
            Ok(Value::List(items))
        }
    }
}

/// Arithmetic on NULL stays NULL.
fn arithmetic(current: &Value, operand: &Value, op: Arith) -> Result<Value, StorageError> {
    let invalid = |reason: &str| StorageError::InvalidStatement(format!("{reason} ({current:?}, {operand:?})"));
    match (current, operand) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Int(a), Value::Int(b)) => {
            let result = match op {
                Arith::Add => a.checked_add(*b),
                Arith::Sub => a.checked_sub(*b),
                Arith::Mul => a.checked_mul(*b),
                Arith::Div => a.checked_div(*b),
            };
            result.map(Value::Int).ok_or_else(|| invalid("integer overflow or division by zero"))
        }
        (Value::Decimal(a), _) => {
            let b = match operand {
                Value::Decimal(b) => *b,
                Value::Int(b) => Decimal::from(*b),
                _ => return Err(invalid("non-decimal operand")),
            };
            let result = match op {
                Arith::Add => a.checked_add(b),
                Arith::Sub => a.checked_sub(b),
                Arith::Mul => a.checked_mul(b),
                Arith::Div => a.checked_div(b),
            };
            result.map(Value::Decimal).ok_or_else(|| invalid("decimal overflow or division by zero"))
        }
        (Value::Float(a), _) => {
            let b = operand.as_f64().ok_or_else(|| invalid("non-numeric operand"))?;
            Ok(Value::Float(match op {
                Arith::Add => a + b,
                Arith::Sub => a - b,
                Arith::Mul => a * b,
                Arith::Div => a / b,
            }))
        }
        _ => Err(invalid("arithmetic on a non-numeric value")),
    }
}
