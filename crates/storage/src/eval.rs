//! Reference evaluation of the statement IR over in-memory rows.
//!
//! [`condition_truth`] is also used by the engine to apply `having`
//! conditions to aggregated values.

use std::cmp::Ordering;
use std::collections::HashMap;

use schema::value::compare_json;
use schema::{Join, SchemaRegistry, Value};
use serde_json::Value as Json;

use crate::statement::{
    Condition, Filter, JsonCondition, JsonOp, JsonTarget, OrderBy, OrderKey, Outcome, Quantifier, Record, TextOp,
};
use crate::StorageError;

static NULL: Value = Value::Null;

/// Value of `field` in `row`; absent fields read as NULL.
pub fn field_value<'r>(row: &'r Record, field: &str) -> &'r Value {
    row.get(field).unwrap_or(&NULL)
}

/// Values of `fields` in `row`, in order.
pub fn project(row: &Record, fields: &[String]) -> Vec<Value> {
    fields.iter().map(|f| field_value(row, f).clone()).collect()
}

// ---------------------------------------------------------------------------
// Field conditions
// ---------------------------------------------------------------------------

/// Three-valued AND: false wins, then unknown (`None`).
pub fn conjunction(truths: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for truth in truths {
        match truth {
            Some(false) => return Some(false),
            None => unknown = true,
            Some(true) => {}
        }
    }
    if unknown {
        None
    } else {
        Some(true)
    }
}

/// Three-valued OR: true wins, then unknown (`None`).
pub fn disjunction(truths: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for truth in truths {
        match truth {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

/// True when the condition holds; unknown counts as not holding.
pub fn condition_matches(value: &Value, condition: &Condition, insensitive: bool) -> bool {
    condition_truth(value, condition, insensitive) == Some(true)
}

/// Evaluate one condition with SQL NULL semantics: any comparison against
/// NULL is unknown (`None`), and only `equals: null` tests for NULL itself.
pub fn condition_truth(value: &Value, condition: &Condition, insensitive: bool) -> Option<bool> {
    match condition {
        Condition::Equals(Value::Null) => return Some(value.is_null()),
        Condition::Not(inner) => {
            return conjunction(inner.iter().map(|c| condition_truth(value, c, insensitive))).map(|b| !b)
        }
        Condition::Json(json) => return json_truth(value, json),
        _ if value.is_null() => return None,
        _ => {}
    }
    Some(match condition {
        Condition::Equals(expected) => equals(value, expected, insensitive),
        Condition::In(options) => options.iter().any(|o| equals(value, o, insensitive)),
        Condition::NotIn(options) => !options.iter().any(|o| equals(value, o, insensitive)),
        Condition::Compare(op, bound) => compare(value, bound, insensitive).map_or(false, |o| op.accepts(o)),
        Condition::Text { op, needle } => value
            .as_str()
            .map_or(false, |text| text_matches(*op, text, needle, insensitive)),
        Condition::Has(element) => list(value).map_or(false, |items| contains(items, element)),
        Condition::HasEvery(elements) => {
            list(value).map_or(false, |items| elements.iter().all(|e| contains(items, e)))
        }
        Condition::HasSome(elements) => {
            list(value).map_or(false, |items| elements.iter().any(|e| contains(items, e)))
        }
        Condition::IsEmpty(empty) => list(value).map_or(false, |items| items.is_empty() == *empty),
        Condition::Not(_) | Condition::Json(_) => return None,
    })
}

fn equals(value: &Value, expected: &Value, insensitive: bool) -> bool {
    match (insensitive, value, expected) {
        (true, Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => value.loosely_equals(expected),
    }
}

fn compare(value: &Value, bound: &Value, insensitive: bool) -> Option<Ordering> {
    match (insensitive, value, bound) {
        (true, Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => value.compare(bound),
    }
}

fn text_matches(op: TextOp, text: &str, needle: &str, insensitive: bool) -> bool {
    let (text, needle) = if insensitive {
        (text.to_lowercase(), needle.to_lowercase())
    } else {
        (text.to_owned(), needle.to_owned())
    };
    match op {
        TextOp::Contains => text.contains(&needle),
        TextOp::StartsWith => text.starts_with(&needle),
        TextOp::EndsWith => text.ends_with(&needle),
    }
}

fn list(value: &Value) -> Option<&[Value]> {
    match value {
        Value::List(items) => Some(items),
        _ => None,
    }
}

fn contains(items: &[Value], element: &Value) -> bool {
    items.iter().any(|item| item.loosely_equals(element))
}

// ---------------------------------------------------------------------------
// JSON conditions
// ---------------------------------------------------------------------------

fn json_truth(value: &Value, condition: &JsonCondition) -> Option<bool> {
    let document = match value {
        Value::Null => None,
        Value::Json(doc) => Some(doc),
        _ => return Some(false),
    };
    let target = document.and_then(|doc| walk(doc, &condition.path));

    // Null-state tests are definite; anything else against SQL NULL is unknown.
    match &condition.op {
        JsonOp::Equals(expected @ (JsonTarget::DbNull | JsonTarget::AnyNull)) => {
            return Some(target_equals(target, expected))
        }
        JsonOp::Not(expected @ (JsonTarget::DbNull | JsonTarget::AnyNull)) => {
            return Some(!target_equals(target, expected))
        }
        _ if target.is_none() => return None,
        _ => {}
    }

    Some(match &condition.op {
        JsonOp::Equals(expected) => target_equals(target, expected),
        JsonOp::Not(expected) => !target_equals(target, expected),
        JsonOp::StringContains(needle) => json_str(target).map_or(false, |s| s.contains(needle.as_str())),
        JsonOp::StringStartsWith(needle) => json_str(target).map_or(false, |s| s.starts_with(needle.as_str())),
        JsonOp::StringEndsWith(needle) => json_str(target).map_or(false, |s| s.ends_with(needle.as_str())),
        JsonOp::ArrayContains(needle) => json_array(target).map_or(false, |items| match needle {
            Json::Array(wanted) => wanted.iter().all(|w| items.contains(w)),
            other => items.contains(other),
        }),
        JsonOp::ArrayStartsWith(needle) => json_array(target).map_or(false, |items| match needle {
            Json::Array(prefix) => items.starts_with(prefix),
            other => items.first() == Some(other),
        }),
        JsonOp::ArrayEndsWith(needle) => json_array(target).map_or(false, |items| match needle {
            Json::Array(suffix) => items.ends_with(suffix),
            other => items.last() == Some(other),
        }),
        JsonOp::Compare(op, bound) => target
            .and_then(|t| compare_json(t, bound))
            .map_or(false, |o| op.accepts(o)),
    })
}

/// `None` stands for SQL NULL: the column is NULL or the path is missing.
fn target_equals(target: Option<&Json>, expected: &JsonTarget) -> bool {
    match expected {
        JsonTarget::DbNull => target.is_none(),
        JsonTarget::JsonNull => target.map_or(false, Json::is_null),
        JsonTarget::AnyNull => target.map_or(true, Json::is_null),
        JsonTarget::Value(doc) => target == Some(doc),
    }
}

fn walk<'a>(doc: &'a Json, path: &[String]) -> Option<&'a Json> {
    path.iter().try_fold(doc, |current, key| match current {
        Json::Object(map) => map.get(key),
        Json::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn json_str(target: Option<&Json>) -> Option<&str> {
    target.and_then(Json::as_str)
}

fn json_array(target: Option<&Json>) -> Option<&Vec<Json>> {
    target.and_then(Json::as_array)
}

// ---------------------------------------------------------------------------
// Row-level evaluation
// ---------------------------------------------------------------------------

/// Evaluates filters and order keys against a set of tables and the outcomes
/// of the statements already executed in the batch.
pub struct Evaluator<'a> {
    registry: &'a SchemaRegistry,
    tables: &'a HashMap<String, Vec<Record>>,
    steps: &'a [Outcome],
}

impl<'a> Evaluator<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        tables: &'a HashMap<String, Vec<Record>>,
        steps: &'a [Outcome],
    ) -> Self {
        Self { registry, tables, steps }
    }

    /// Rows of a declared entity.
    pub fn rows(&self, entity: &str) -> Result<&'a [Record], StorageError> {
        self.registry
            .entity(entity)
            .map_err(|e| StorageError::InvalidStatement(e.to_string()))?;
        Ok(self.tables.get(entity).map_or(&[][..], Vec::as_slice))
    }

    /// True when the row satisfies the filter; unknown counts as not satisfying it.
    pub fn matches(&self, entity: &str, row: &Record, filter: &Filter) -> Result<bool, StorageError> {
        Ok(self.truth(entity, row, filter)? == Some(true))
    }

    /// Three-valued evaluation, so `NOT` over an unknown comparison stays unknown.
    pub fn truth(&self, entity: &str, row: &Record, filter: &Filter) -> Result<Option<bool>, StorageError> {
        Ok(match filter {
            Filter::And(children) => conjunction(self.truths(entity, row, children)?),
            Filter::Or(children) => disjunction(self.truths(entity, row, children)?),
            Filter::Not(children) => conjunction(self.truths(entity, row, children)?).map(|b| !b),
            Filter::Field(field) => {
                let value = field_value(row, &field.field);
                conjunction(
                    field
                        .conditions
                        .iter()
                        .map(|c| condition_truth(value, c, field.insensitive)),
                )
            }
            Filter::Relation(relation) => {
                let target = relation.join.target.as_str();
                let related = self.related(row, &relation.join)?;
                let mut hits = 0usize;
                let mut misses = 0usize;
                for other in &related {
                    match self.truth(target, other, &relation.filter)? {
                        Some(true) => hits += 1,
                        Some(false) => misses += 1,
                        None => {}
                    }
                }
                // `every` holds unless some related row definitely fails.
                Some(match relation.quantifier {
                    Quantifier::Some => hits > 0,
                    Quantifier::Every => misses == 0,
                    Quantifier::None => hits == 0,
                })
            }
            Filter::Step(step) => Some(self.in_step(entity, row, *step)?),
        })
    }

    fn truths(&self, entity: &str, row: &Record, children: &[Filter]) -> Result<Vec<Option<bool>>, StorageError> {
        children.iter().map(|child| self.truth(entity, row, child)).collect()
    }

    /// Rows of `join.target` whose `remote` columns equal the row's `local` columns.
    pub fn related(&self, row: &Record, join: &Join) -> Result<Vec<&'a Record>, StorageError> {
        let key = project(row, &join.local);
        if key.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }
        Ok(self
            .rows(&join.target)?
            .iter()
            .filter(|other| project(other, &join.remote) == key)
            .collect())
    }

    fn in_step(&self, entity: &str, row: &Record, step: usize) -> Result<bool, StorageError> {
        let outcome = self
            .steps
            .get(step)
            .ok_or_else(|| StorageError::InvalidStatement(format!("step {step} has not been executed")))?;
        let identity = &self
            .registry
            .entity(entity)
            .map_err(|e| StorageError::InvalidStatement(e.to_string()))?
            .identity
            .fields;
        let key = project(row, identity);
        Ok(outcome.rows().iter().any(|other| project(other, identity) == key))
    }

    /// Sort key values for `row`, one per order entry.
    pub fn order_keys(&self, row: &Record, order: &[OrderBy]) -> Result<Vec<Value>, StorageError> {
        order
            .iter()
            .map(|entry| {
                Ok(match &entry.key {
                    OrderKey::Field(field) => field_value(row, field).clone(),
                    OrderKey::RelationCount(join) => Value::Int(self.related(row, join)?.len() as i64),
                    OrderKey::RelatedField { join, field } => self
                        .related(row, join)?
                        .first()
                        .map_or(Value::Null, |other| field_value(other, field).clone()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{CompareOp, FieldFilter};
    use serde_json::json;

    #[test]
    fn field_level_not_never_matches_null() {
        let not_admin = Condition::Not(vec![Condition::Equals(Value::from("admin"))]);
        assert!(condition_matches(&Value::from("guest"), &not_admin, false));
        assert!(!condition_matches(&Value::Null, &not_admin, false));

        let is_not_null = Condition::Not(vec![Condition::Equals(Value::Null)]);
        assert!(condition_matches(&Value::from("x"), &is_not_null, false));
        assert!(!condition_matches(&Value::Null, &is_not_null, false));
    }

    #[test]
    fn not_in_skips_null() {
        let cond = Condition::NotIn(vec![Value::Int(1)]);
        assert!(condition_matches(&Value::Int(2), &cond, false));
        assert!(!condition_matches(&Value::Null, &cond, false));
    }

    #[test]
    fn insensitive_mode_applies_to_every_string_operator() {
        let starts = Condition::Text {
            op: TextOp::StartsWith,
            needle: "ACME".into(),
        };
        assert!(condition_matches(&Value::from("acme corp"), &starts, true));
        assert!(!condition_matches(&Value::from("acme corp"), &starts, false));
        assert!(condition_matches(
            &Value::from("Bob"),
            &Condition::Compare(CompareOp::Gt, Value::from("alice")),
            true
        ));
    }

    #[test]
    fn list_operators() {
        let tags = Value::List(vec![Value::from("crm"), Value::from("email")]);
        assert!(condition_matches(&tags, &Condition::Has(Value::from("crm")), false));
        assert!(condition_matches(
            &tags,
            &Condition::HasEvery(vec![Value::from("crm"), Value::from("email")]),
            false
        ));
        assert!(!condition_matches(&tags, &Condition::HasSome(vec![Value::from("sms")]), false));
        assert!(condition_matches(&Value::List(vec![]), &Condition::IsEmpty(true), false));
    }

    #[test]
    fn json_null_states_are_distinguished() {
        let eq = |target| Condition::Json(JsonCondition {
            path: vec![],
            op: JsonOp::Equals(target),
        });
        let db_null = Value::Null;
        let json_null = Value::Json(Json::Null);

        assert!(condition_matches(&db_null, &eq(JsonTarget::DbNull), false));
        assert!(!condition_matches(&json_null, &eq(JsonTarget::DbNull), false));
        assert!(condition_matches(&json_null, &eq(JsonTarget::JsonNull), false));
        assert!(!condition_matches(&db_null, &eq(JsonTarget::JsonNull), false));
        assert!(condition_matches(&db_null, &eq(JsonTarget::AnyNull), false));
        assert!(condition_matches(&json_null, &eq(JsonTarget::AnyNull), false));
    }

    #[test]
    fn json_path_operators() {
        let doc = Value::Json(json!({"retry": {"max": 5}, "channels": ["email", "slack"]}));
        let at = |path: &[&str], op| Condition::Json(JsonCondition {
            path: path.iter().map(|p| p.to_string()).collect(),
            op,
        });
        assert!(condition_matches(&doc, &at(&["retry", "max"], JsonOp::Compare(CompareOp::Gte, json!(5))), false));
        assert!(condition_matches(&doc, &at(&["channels"], JsonOp::ArrayContains(json!(["slack"]))), false));
        assert!(condition_matches(&doc, &at(&["channels"], JsonOp::ArrayStartsWith(json!("email"))), false));
        assert!(condition_matches(&doc, &at(&["channels", "1"], JsonOp::StringEndsWith("ack".into())), false));
        // A missing path reads as SQL NULL.
        assert!(condition_matches(&doc, &at(&["missing"], JsonOp::Equals(JsonTarget::DbNull)), false));
    }

    #[test]
    fn block_not_keeps_null_comparisons_unknown() {
        let registry = schema::platform::platform_registry().unwrap();
        let tables = HashMap::new();
        let evaluator = Evaluator::new(&registry, &tables, &[]);
        let nameless = Record::from([("id".to_string(), Value::from("u1")), ("name".to_string(), Value::Null)]);
        let named_x = || Filter::Field(FieldFilter::new("name", vec![Condition::Equals(Value::from("x"))]));

        assert_eq!(evaluator.truth("User", &nameless, &named_x()).unwrap(), None);
        assert!(!evaluator.matches("User", &nameless, &Filter::Not(vec![named_x()])).unwrap());
        assert!(!evaluator.matches("User", &nameless, &Filter::Not(vec![Filter::Not(vec![named_x()])])).unwrap());

        // OR with a definite true still matches; AND with a definite false is definitely false.
        let has_id = Filter::Field(FieldFilter::new("id", vec![Condition::Equals(Value::from("u1"))]));
        assert!(evaluator.matches("User", &nameless, &Filter::Or(vec![named_x(), has_id])).unwrap());
        let other_id = Filter::Field(FieldFilter::new("id", vec![Condition::Equals(Value::from("u2"))]));
        assert!(evaluator
            .matches("User", &nameless, &Filter::Not(vec![Filter::And(vec![named_x(), other_id])]))
            .unwrap());
    }
}
