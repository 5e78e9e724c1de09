//! Aggregation Engine: `aggregate` and `groupBy`.
//!
//! Both read the filtered rows with one `Find` and compute in the engine.
//! Empty sets yield `0` counts and `null` for every other aggregate.

use std::collections::HashMap;

use rust_decimal::Decimal;
use schema::{Entity, Field, ScalarKind, Value};
use serde_json::{Map, Value as Json};
use storage::eval::{condition_truth, conjunction, disjunction, field_value, project};
use storage::window::{compare_keys, slice};
use storage::{Condition, OrderBy, OrderKey, Record, Statement, Window};

use crate::descriptor::{parse_args, AggregateArgs, FindArgs, GroupByArgs};
use crate::order::{order_entries, parse_direction, single_key, tiebreak};
use crate::plan::{at, BatchBuilder, Finish, Planner};
use crate::QueryError;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// One value computed over a set of rows.
#[derive(Debug, Clone, PartialEq)]
enum Metric {
    Count,
    /// Non-null values of a field.
    CountField(String),
    Min(String),
    Max(String),
    Avg(String),
    Sum(String),
    /// The group's value of a `by` field.
    Key(String),
}

impl Metric {
    fn value(&self, rows: &[&Record]) -> Value {
        match self {
            Metric::Count => Value::Int(rows.len() as i64),
            Metric::CountField(field) => Value::Int(present(rows, field).len() as i64),
            Metric::Min(field) => extreme(&present(rows, field), std::cmp::Ordering::Less),
            Metric::Max(field) => extreme(&present(rows, field), std::cmp::Ordering::Greater),
            Metric::Avg(field) => average(&present(rows, field)),
            Metric::Sum(field) => sum(&present(rows, field)),
            Metric::Key(field) => rows.first().map_or(Value::Null, |row| field_value(row, field).clone()),
        }
    }
}

fn present<'r>(rows: &[&'r Record], field: &str) -> Vec<&'r Value> {
    rows.iter()
        .map(|&row| field_value(row, field))
        .filter(|v| !v.is_null())
        .collect()
}

fn extreme(values: &[&Value], wanted: std::cmp::Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for &value in values {
        if best.map_or(true, |b| value.compare(b) == Some(wanted)) {
            best = Some(value);
        }
    }
    best.cloned().unwrap_or(Value::Null)
}

/// Int sums stay Int (Float once they leave the i64 range), Decimal sums stay
/// Decimal.
fn sum(values: &[&Value]) -> Value {
    match values.first() {
        None => Value::Null,
        Some(Value::Int(_)) => {
            let total: i128 = values
                .iter()
                .filter_map(|v| match v {
                    Value::Int(n) => Some(i128::from(*n)),
                    _ => None,
                })
                .sum();
            i64::try_from(total).map_or(Value::Float(total as f64), Value::Int)
        }
        Some(Value::Decimal(_)) => values
            .iter()
            .try_fold(Decimal::ZERO, |acc, v| match v {
                Value::Decimal(d) => acc.checked_add(*d),
                _ => Some(acc),
            })
            .map_or_else(|| Value::Float(float_sum(values)), Value::Decimal),
        Some(_) => Value::Float(float_sum(values)),
    }
}

fn float_sum(values: &[&Value]) -> f64 {
    values.iter().filter_map(|v| v.as_f64()).sum()
}

fn average(values: &[&Value]) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    let n = values.len();
    match sum(values) {
        Value::Decimal(total) => total.checked_div(Decimal::from(n)).map_or(Value::Null, Value::Decimal),
        total => total.as_f64().map_or(Value::Null, |t| Value::Float(t / n as f64)),
    }
}

// ---------------------------------------------------------------------------
// Aggregate selections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum CountSelection {
    Total,
    Fields { all: bool, fields: Vec<String> },
}

/// `_count`, `_min`, `_max`, `_avg` and `_sum` selections.
#[derive(Debug, Clone, Default)]
pub(crate) struct Aggregates {
    count: Option<CountSelection>,
    min: Vec<String>,
    max: Vec<String>,
    avg: Vec<String>,
    sum: Vec<String>,
}

impl Aggregates {
    pub(crate) fn compute(&self, rows: &[Record]) -> Json {
        let rows: Vec<&Record> = rows.iter().collect();
        Json::Object(self.summarize(&rows))
    }

    fn summarize(&self, rows: &[&Record]) -> Map<String, Json> {
        let mut out = Map::new();
        match &self.count {
            None => {}
            Some(CountSelection::Total) => {
                out.insert("_count".into(), Json::from(rows.len()));
            }
            Some(CountSelection::Fields { all, fields }) => {
                let mut counts = Map::new();
                if *all {
                    counts.insert("_all".into(), Json::from(rows.len()));
                }
                for field in fields {
                    counts.insert(field.clone(), Json::from(present(rows, field).len()));
                }
                out.insert("_count".into(), Json::Object(counts));
            }
        }
        let sections: [(&str, &Vec<String>, fn(String) -> Metric); 4] = [
            ("_min", &self.min, Metric::Min),
            ("_max", &self.max, Metric::Max),
            ("_avg", &self.avg, Metric::Avg),
            ("_sum", &self.sum, Metric::Sum),
        ];
        for (key, fields, metric) in sections {
            if fields.is_empty() {
                continue;
            }
            let values = fields
                .iter()
                .map(|field| (field.clone(), metric(field.clone()).value(rows).to_json()))
                .collect();
            out.insert(key.into(), Json::Object(values));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Predicate over a group in `having`.
#[derive(Debug, Clone)]
enum Having {
    And(Vec<Having>),
    Or(Vec<Having>),
    Not(Vec<Having>),
    Test {
        metric: Metric,
        conditions: Vec<Condition>,
        insensitive: bool,
    },
}

impl Having {
    fn matches(&self, rows: &[&Record]) -> bool {
        self.truth(rows) == Some(true)
    }

    /// Same three-valued logic as row filters; a NULL aggregate is unknown.
    fn truth(&self, rows: &[&Record]) -> Option<bool> {
        match self {
            Having::And(parts) => conjunction(parts.iter().map(|p| p.truth(rows))),
            Having::Or(parts) => disjunction(parts.iter().map(|p| p.truth(rows))),
            Having::Not(parts) => conjunction(parts.iter().map(|p| p.truth(rows))).map(|b| !b),
            Having::Test { metric, conditions, insensitive } => {
                let value = metric.value(rows);
                conjunction(conditions.iter().map(|c| condition_truth(&value, c, *insensitive)))
            }
        }
    }
}

/// A resolved `groupBy`.
#[derive(Debug, Clone)]
pub(crate) struct Grouping {
    by: Vec<String>,
    aggregates: Aggregates,
    having: Option<Having>,
    /// Sort keys of groups; `OrderBy::key` is only a label.
    order: Vec<(Metric, OrderBy)>,
    skip: u64,
    take: Option<i64>,
}

impl Grouping {
    pub(crate) fn groups(&self, rows: &[Record]) -> Vec<Json> {
        let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
        let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
        for row in rows {
            let key = project(row, &self.by);
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![row]));
                }
            }
        }

        let mut kept: Vec<(Vec<Value>, Vec<Value>, Vec<&Record>)> = groups
            .into_iter()
            .filter(|(_, members)| self.having.as_ref().map_or(true, |h| h.matches(members)))
            .map(|(key, members)| {
                let sort_keys = self.order.iter().map(|(metric, _)| metric.value(&members)).collect();
                (sort_keys, key, members)
            })
            .collect();
        if !self.order.is_empty() {
            let order: Vec<OrderBy> = self.order.iter().map(|(_, o)| o.clone()).collect();
            kept.sort_by(|a, b| compare_keys(&a.0, &b.0, &order));
        }

        let range = slice(kept.len(), None, self.skip, self.take);
        kept.drain(range)
            .map(|(_, key, members)| {
                let mut object = Map::new();
                for (field, value) in self.by.iter().zip(&key) {
                    object.insert(field.clone(), value.to_json());
                }
                object.extend(self.aggregates.summarize(&members));
                Json::Object(object)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

const AGGREGATE_KEYS: [&str; 5] = ["_count", "_min", "_max", "_avg", "_sum"];

impl Planner<'_> {
    pub(crate) fn aggregate(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: AggregateArgs = parse_args(&entity.name, "args", args)?;
        let selection = self.parse_aggregates(
            entity,
            [
                args.count.as_ref(),
                args.min.as_ref(),
                args.max.as_ref(),
                args.avg.as_ref(),
                args.sum.as_ref(),
            ],
        )?;
        let read = self.scoped_read(
            entity,
            &FindArgs {
                filter: args.filter,
                order_by: args.order_by,
                cursor: args.cursor,
                take: args.take,
                skip: args.skip,
                ..FindArgs::default()
            },
            "",
        )?;
        let step = batch.push(Statement::Find {
            entity: entity.name.clone(),
            filter: read.filter,
            order: read.order,
            window: read.window,
        });
        Ok(Finish::Aggregate { step, aggregates: selection })
    }

    pub(crate) fn group_by(&self, batch: &mut BatchBuilder, entity: &Entity, args: &Json) -> Result<Finish, QueryError> {
        let args: GroupByArgs = parse_args(&entity.name, "args", args)?;
        let by = self.group_fields(entity, &args.by)?;
        let aggregates = self.parse_aggregates(
            entity,
            [
                args.count.as_ref(),
                args.min.as_ref(),
                args.max.as_ref(),
                args.avg.as_ref(),
                args.sum.as_ref(),
            ],
        )?;
        let filter = match &args.filter {
            Some(json) => self.parse_filter(entity, json, "where")?,
            None => storage::Filter::all(),
        };
        let having = match &args.having {
            Some(json) => Some(self.having_at(entity, &by, json, "having", 1)?),
            None => None,
        };
        let order = match &args.order_by {
            Some(json) => self.group_order(entity, &by, json)?,
            None => Vec::new(),
        };
        if order.is_empty() {
            for (key, given) in [("take", args.take.is_some()), ("skip", args.skip.is_some())] {
                if given {
                    return Err(QueryError::validation(&entity.name, key, "take and skip require orderBy"));
                }
            }
        }
        let skip = match args.skip {
            Some(n) => u64::try_from(n)
                .map_err(|_| QueryError::validation(&entity.name, "skip", "skip must not be negative"))?,
            None => 0,
        };

        let step = batch.push(Statement::Find {
            entity: entity.name.clone(),
            filter,
            order: tiebreak(entity, Vec::new()),
            window: Window::default(),
        });
        Ok(Finish::Groups {
            step,
            grouping: Grouping {
                by,
                aggregates,
                having,
                order,
                skip,
                take: args.take,
            },
        })
    }

    /// `[_count, _min, _max, _avg, _sum]` selections.
    fn parse_aggregates(&self, entity: &Entity, [count, min, max, avg, sum]: [Option<&Json>; 5]) -> Result<Aggregates, QueryError> {
        let count = match count {
            None | Some(Json::Bool(false)) => None,
            Some(Json::Bool(true)) => Some(CountSelection::Total),
            Some(Json::Object(map)) => {
                let mut all = false;
                let mut fields = Vec::new();
                for (key, value) in map {
                    let here = at("_count", key);
                    let wanted = value
                        .as_bool()
                        .ok_or_else(|| QueryError::validation(&entity.name, &here, "expected true or false"))?;
                    if key == "_all" {
                        all = wanted;
                    } else if entity.field(key).is_none() {
                        return Err(QueryError::validation(
                            &entity.name,
                            &here,
                            format!("unknown field '{key}' on {}", entity.name),
                        ));
                    } else if wanted {
                        fields.push(key.clone());
                    }
                }
                Some(CountSelection::Fields { all, fields })
            }
            Some(_) => return Err(QueryError::validation(&entity.name, "_count", "expected true or an object")),
        };
        Ok(Aggregates {
            count,
            min: self.aggregate_fields(entity, min, "_min")?,
            max: self.aggregate_fields(entity, max, "_max")?,
            avg: self.aggregate_fields(entity, avg, "_avg")?,
            sum: self.aggregate_fields(entity, sum, "_sum")?,
        })
    }

    fn aggregate_fields(&self, entity: &Entity, json: Option<&Json>, key: &str) -> Result<Vec<String>, QueryError> {
        let Some(json) = json else {
            return Ok(Vec::new());
        };
        let map = json
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, key, "expected an object of fields"))?;
        let mut fields = Vec::with_capacity(map.len());
        for (name, value) in map {
            let here = at(key, name);
            let field = entity.field(name).ok_or_else(|| {
                QueryError::validation(&entity.name, &here, format!("unknown field '{name}' on {}", entity.name))
            })?;
            check_applicable(entity, field, key, &here)?;
            match value {
                Json::Bool(true) => fields.push(field.name.clone()),
                Json::Bool(false) => {}
                _ => return Err(QueryError::validation(&entity.name, &here, "expected true or false")),
            }
        }
        Ok(fields)
    }

    fn group_fields(&self, entity: &Entity, json: &Json) -> Result<Vec<String>, QueryError> {
        let names: Vec<&str> = match json {
            Json::String(name) => vec![name.as_str()],
            Json::Array(items) => items
                .iter()
                .map(Json::as_str)
                .collect::<Option<_>>()
                .ok_or_else(|| QueryError::validation(&entity.name, "by", "expected field names"))?,
            _ => return Err(QueryError::validation(&entity.name, "by", "expected a field name or a list of them")),
        };
        if names.is_empty() {
            return Err(QueryError::validation(&entity.name, "by", "by must name at least one field"));
        }
        names
            .into_iter()
            .map(|name| match entity.field(name) {
                Some(field) if !field.list && field.kind != ScalarKind::Json => Ok(field.name.clone()),
                Some(_) => Err(QueryError::validation(
                    &entity.name,
                    "by",
                    format!("cannot group by list or JSON field '{name}'"),
                )),
                None => Err(QueryError::validation(
                    &entity.name,
                    "by",
                    format!("unknown field '{name}' on {}", entity.name),
                )),
            })
            .collect()
    }

    fn having_at(&self, entity: &Entity, by: &[String], json: &Json, path: &str, depth: usize) -> Result<Having, QueryError> {
        self.check_depth(entity, path, depth)?;
        let map = json
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected a having object"))?;
        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            let here = at(path, key);
            let part = match key.as_str() {
                "AND" | "OR" | "NOT" => {
                    let children = match value {
                        Json::Array(items) => items
                            .iter()
                            .enumerate()
                            .map(|(i, item)| self.having_at(entity, by, item, &format!("{here}[{i}]"), depth + 1))
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => vec![self.having_at(entity, by, value, &here, depth + 1)?],
                    };
                    match key.as_str() {
                        "AND" => Having::And(children),
                        "OR" => Having::Or(children),
                        _ => Having::Not(children),
                    }
                }
                "_count" => self.metric_test(entity, Metric::Count, &Field::new("_count", ScalarKind::Int), value, &here)?,
                name => {
                    let field = entity.field(name).ok_or_else(|| {
                        QueryError::validation(&entity.name, &here, format!("unknown field '{name}' on {}", entity.name))
                    })?;
                    let aggregated = value
                        .as_object()
                        .filter(|ops| !ops.is_empty() && ops.keys().all(|k| AGGREGATE_KEYS.contains(&k.as_str())));
                    match aggregated {
                        Some(ops) => {
                            let mut tests = Vec::with_capacity(ops.len());
                            for (aggregate, conditions) in ops {
                                let at_aggregate = at(&here, aggregate);
                                let (metric, synthetic) = aggregate_metric(entity, field, aggregate, &at_aggregate)?;
                                tests.push(self.metric_test(entity, metric, &synthetic, conditions, &at_aggregate)?);
                            }
                            if tests.len() == 1 {
                                tests.remove(0)
                            } else {
                                Having::And(tests)
                            }
                        }
                        None => {
                            if !by.contains(&field.name) {
                                return Err(QueryError::validation(
                                    &entity.name,
                                    &here,
                                    format!("'{name}' must be listed in by to be used in having"),
                                ));
                            }
                            self.metric_test(entity, Metric::Key(field.name.clone()), field, value, &here)?
                        }
                    }
                }
            };
            parts.push(part);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Having::And(parts)
        })
    }

    fn metric_test(&self, entity: &Entity, metric: Metric, field: &Field, json: &Json, path: &str) -> Result<Having, QueryError> {
        let (conditions, insensitive) = self.field_conditions(&entity.name, field, json, path)?;
        Ok(Having::Test {
            metric,
            conditions,
            insensitive,
        })
    }

    fn group_order(&self, entity: &Entity, by: &[String], json: &Json) -> Result<Vec<(Metric, OrderBy)>, QueryError> {
        let mut order = Vec::new();
        for (here, key, value) in order_entries(&entity.name, json, "orderBy")? {
            if AGGREGATE_KEYS.contains(&key.as_str()) {
                let (at_field, name, direction) = single_key(&entity.name, value, &here)?;
                let metric = if key == "_count" && name == "_all" {
                    Metric::Count
                } else {
                    let field = entity.field(name).ok_or_else(|| {
                        QueryError::validation(&entity.name, &at_field, format!("unknown field '{name}' on {}", entity.name))
                    })?;
                    aggregate_metric(entity, field, key, &at_field)?.0
                };
                order.push((
                    metric,
                    OrderBy {
                        key: OrderKey::Field(format!("{key}.{name}")),
                        direction: parse_direction(&entity.name, direction, &at_field)?,
                        nulls: None,
                    },
                ));
                continue;
            }
            if !by.contains(key) {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("'{key}' must be listed in by to be used in orderBy"),
                ));
            }
            let entry = self.order_entry(entity, key, value, &here)?;
            order.push((Metric::Key(key.clone()), entry));
        }
        Ok(order)
    }
}

/// Metric of `aggregate` over `field` plus the field its conditions are typed as.
fn aggregate_metric(entity: &Entity, field: &Field, aggregate: &str, path: &str) -> Result<(Metric, Field), QueryError> {
    check_applicable(entity, field, aggregate, path)?;
    let name = field.name.clone();
    Ok(match aggregate {
        "_count" => (Metric::CountField(name.clone()), Field::new(name, ScalarKind::Int)),
        "_min" => (Metric::Min(name.clone()), Field::new(name, field.kind.clone()).optional()),
        "_max" => (Metric::Max(name.clone()), Field::new(name, field.kind.clone()).optional()),
        "_sum" => (Metric::Sum(name.clone()), Field::new(name, field.kind.clone()).optional()),
        _ => {
            let kind = if field.kind == ScalarKind::Decimal {
                ScalarKind::Decimal
            } else {
                ScalarKind::Float
            };
            (Metric::Avg(name.clone()), Field::new(name, kind).optional())
        }
    })
}

fn check_applicable(entity: &Entity, field: &Field, aggregate: &str, path: &str) -> Result<(), QueryError> {
    let (ok, requirement) = match aggregate {
        "_min" | "_max" => (field.is_orderable(), "an orderable"),
        "_avg" | "_sum" => (field.is_numeric(), "a numeric"),
        _ => (true, ""),
    };
    if ok {
        Ok(())
    } else {
        Err(QueryError::validation(
            &entity.name,
            path,
            format!("{aggregate} requires {requirement} field; '{}' is {}", field.name, field.kind.label()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record(pairs: Vec<(&str, Value)>) -> Record {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn int_sums_stay_integers_and_averages_are_floats() {
        let rows = [
            record(vec![("n", Value::Int(2))]),
            record(vec![("n", Value::Int(3))]),
            record(vec![("n", Value::Null)]),
        ];
        let rows: Vec<&Record> = rows.iter().collect();
        assert_eq!(Metric::Sum("n".into()).value(&rows), Value::Int(5));
        assert_eq!(Metric::Avg("n".into()).value(&rows), Value::Float(2.5));
        assert_eq!(Metric::CountField("n".into()).value(&rows), Value::Int(2));
        assert_eq!(Metric::Min("n".into()).value(&rows), Value::Int(2));
        assert_eq!(Metric::Max("n".into()).value(&rows), Value::Int(3));
    }

    #[test]
    fn decimal_aggregates_stay_decimal() {
        let d = |s: &str| Value::Decimal(Decimal::from_str(s).unwrap());
        let rows = [record(vec![("p", d("1.10"))]), record(vec![("p", d("2.20"))])];
        let rows: Vec<&Record> = rows.iter().collect();
        assert_eq!(Metric::Sum("p".into()).value(&rows), d("3.30"));
        assert_eq!(Metric::Avg("p".into()).value(&rows), d("1.65"));
    }

    #[test]
    fn empty_sets_yield_zero_counts_and_nulls() {
        let selection = Aggregates {
            count: Some(CountSelection::Total),
            sum: vec!["n".into()],
            ..Aggregates::default()
        };
        assert_eq!(
            selection.compute(&[]),
            serde_json::json!({"_count": 0, "_sum": {"n": null}})
        );
    }

    #[test]
    fn sums_beyond_i64_fall_back_to_float() {
        let rows = [
            record(vec![("n", Value::Int(i64::MAX))]),
            record(vec![("n", Value::Int(i64::MAX))]),
        ];
        let rows: Vec<&Record> = rows.iter().collect();
        assert!(matches!(Metric::Sum("n".into()).value(&rows), Value::Float(_)));
    }
}
