//! The resolved statement IR handed to a [`StorageExecutor`](crate::StorageExecutor).
//!
//! Everything in here is already validated against the schema registry: field
//! names exist, values carry the right kinds and joins are resolved into
//! column pairs. Executors only have to evaluate it.

use std::collections::BTreeMap;

use schema::{Join, Value};
use serde::Serialize;

/// A row: field name to value. Absent fields are treated as NULL.
pub type Record = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Vacuously true when empty.
    And(Vec<Filter>),
    /// Vacuously false when empty.
    Or(Vec<Filter>),
    /// Negates the conjunction of its children.
    Not(Vec<Filter>),
    Field(FieldFilter),
    Relation(RelationFilter),
    /// The row is one of the rows produced by an earlier statement of the batch,
    /// compared by identity.
    Step(usize),
}

impl Filter {
    /// The filter that matches every row.
    pub fn all() -> Filter {
        Filter::And(Vec::new())
    }

    /// Conjunction that flattens trivially-true members away.
    pub fn and(filters: Vec<Filter>) -> Filter {
        let mut kept: Vec<Filter> = filters.into_iter().filter(|f| !f.is_trivial()).collect();
        if kept.len() == 1 {
            kept.remove(0)
        } else {
            Filter::And(kept)
        }
    }

    /// Equality on every field of `values`.
    pub fn matching(values: &Record) -> Filter {
        Filter::and(
            values
                .iter()
                .map(|(field, value)| Filter::Field(FieldFilter::new(field, vec![Condition::Equals(value.clone())])))
                .collect(),
        )
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, Filter::And(children) if children.is_empty())
    }
}

/// Conditions on one field; all of them must hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFilter {
    pub field: String,
    pub conditions: Vec<Condition>,
    /// Case-insensitive comparison for every string condition.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insensitive: bool,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            field: field.into(),
            conditions,
            insensitive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn accepts(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Lt => ordering == Less,
            CompareOp::Lte => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Gte => ordering != Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOp {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// `Equals(Null)` is `IS NULL`. On list fields compares the whole list.
    Equals(Value),
    In(Vec<Value>),
    /// Never matches NULL.
    NotIn(Vec<Value>),
    Compare(CompareOp, Value),
    Text { op: TextOp, needle: String },
    /// Never matches NULL, so `Not([Equals(Null)])` is `IS NOT NULL`.
    Not(Vec<Condition>),
    Has(Value),
    HasEvery(Vec<Value>),
    HasSome(Vec<Value>),
    IsEmpty(bool),
    Json(JsonCondition),
}

/// A condition on a JSON column, optionally on the value found at `path`.
///
/// A missing path behaves like SQL NULL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonCondition {
    pub path: Vec<String>,
    pub op: JsonOp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonOp {
    Equals(JsonTarget),
    Not(JsonTarget),
    StringContains(String),
    StringStartsWith(String),
    StringEndsWith(String),
    ArrayContains(serde_json::Value),
    ArrayStartsWith(serde_json::Value),
    ArrayEndsWith(serde_json::Value),
    Compare(CompareOp, serde_json::Value),
}

/// Right-hand side of a JSON equality: a document or one of the null states.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonTarget {
    Value(serde_json::Value),
    /// SQL NULL only.
    DbNull,
    /// A JSON `null` document only.
    JsonNull,
    /// Either of the two.
    AnyNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    Some,
    Every,
    None,
}

/// Quantified filter over the rows reachable through `join`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationFilter {
    pub join: Join,
    pub quantifier: Quantifier,
    pub filter: Box<Filter>,
}

// ---------------------------------------------------------------------------
// Ordering and windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Field(String),
    /// Number of rows reachable through the join.
    RelationCount(Join),
    /// A field of the single row reachable through a to-one join.
    RelatedField { join: Join, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    pub key: OrderKey,
    pub direction: Direction,
    /// `None` places NULL as the greatest value.
    pub nulls: Option<NullsOrder>,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            key: OrderKey::Field(field.into()),
            direction: Direction::Asc,
            nulls: None,
        }
    }

    pub fn nulls_first(&self) -> bool {
        match self.nulls {
            Some(NullsOrder::First) => true,
            Some(NullsOrder::Last) => false,
            None => self.direction == Direction::Desc,
        }
    }
}

/// Post-ordering row selection, applied in this order:
/// distinct, cursor, skip, take. With a `partition` every step runs
/// independently inside each group of rows sharing the partition values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Window {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub distinct: Vec<String>,
    /// Values of one unique constraint. The cursor row is inclusive; when it is
    /// absent the window is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Record>,
    /// Rows skipped in the direction of `take`.
    pub skip: u64,
    /// Negative values read backwards. `None` is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partition: Vec<String>,
}

impl Window {
    pub fn is_unbounded(&self) -> bool {
        self.distinct.is_empty() && self.cursor.is_none() && self.skip == 0 && self.take.is_none()
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Copy key values from the first row produced by statement `step`.
///
/// Fails with `RecordNotFound` for `target` when that step produced no rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub step: usize,
    pub target: String,
    /// `(local field, field of the step row)` pairs.
    pub pairs: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    Set(Value),
    Increment(Value),
    Decrement(Value),
    Multiply(Value),
    Divide(Value),
    /// Appends one element, or every element of a list.
    Push(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub field: String,
    pub op: AssignOp,
}

impl Assignment {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: AssignOp::Set(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Statements and batches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum Statement {
    Find {
        entity: String,
        filter: Filter,
        order: Vec<OrderBy>,
        window: Window,
    },
    Count {
        entity: String,
        filter: Filter,
        order: Vec<OrderBy>,
        window: Window,
    },
    /// Row counts grouped by the values of `by`.
    Tally {
        entity: String,
        filter: Filter,
        by: Vec<String>,
    },
    Insert {
        entity: String,
        rows: Vec<Record>,
        links: Vec<Link>,
        /// Rows colliding with a unique constraint are dropped instead of failing.
        skip_duplicates: bool,
    },
    Update {
        entity: String,
        filter: Filter,
        order: Vec<OrderBy>,
        limit: Option<u64>,
        assignments: Vec<Assignment>,
        links: Vec<Link>,
        /// Fail with `RecordNotFound` when nothing matches.
        required: bool,
    },
    /// Update the first matching row, or insert `create` when nothing matches.
    Upsert {
        entity: String,
        filter: Filter,
        create: Record,
        update: Vec<Assignment>,
    },
    Delete {
        entity: String,
        filter: Filter,
        order: Vec<OrderBy>,
        limit: Option<u64>,
        required: bool,
    },
}

impl Statement {
    pub fn entity(&self) -> &str {
        match self {
            Statement::Find { entity, .. }
            | Statement::Count { entity, .. }
            | Statement::Tally { entity, .. }
            | Statement::Insert { entity, .. }
            | Statement::Update { entity, .. }
            | Statement::Upsert { entity, .. }
            | Statement::Delete { entity, .. } => entity,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Find { .. } | Statement::Count { .. } | Statement::Tally { .. })
    }
}

/// Ordered statements; later ones may refer to earlier ones by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    pub statements: Vec<Statement>,
    /// Execute all statements or none.
    pub atomic: bool,
}

/// Grouped count produced by [`Statement::Tally`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tally {
    pub key: Vec<Value>,
    pub count: u64,
}

/// Result of one statement, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Rows(Vec<Record>),
    Count(u64),
    Tallies(Vec<Tally>),
    /// Rows as they are after an insert or update, or before a delete.
    Written(Vec<Record>),
    Upserted { created: bool, row: Record },
}

impl Outcome {
    /// Rows carried by the outcome; counts carry none.
    pub fn rows(&self) -> &[Record] {
        match self {
            Outcome::Rows(rows) | Outcome::Written(rows) => rows,
            Outcome::Upserted { row, .. } => std::slice::from_ref(row),
            Outcome::Count(_) | Outcome::Tallies(_) => &[],
        }
    }
}
