//! Filter Algebra: validates caller `where` trees against the registry and
//! resolves them into [`storage::Filter`]s.
//!
//! Operators by field kind:
//! - String: `equals`, `in`, `notIn`, `lt`..`gte`, `contains`, `startsWith`,
//!   `endsWith`, `mode`, `not`.
//! - Int, Float, Decimal, DateTime: `equals`, `in`, `notIn`, `lt`..`gte`, `not`.
//! - Enum: `equals`, `in`, `notIn`, `not`. Boolean: `equals`, `not`.
//! - Lists: `equals`, `has`, `hasEvery`, `hasSome`, `isEmpty`.
//! - Json: `path` plus `equals`, `not`, `string_*`, `array_*`, `lt`..`gte`.
//!
//! JSON null states are written as `{"$null": "db" | "json" | "any"}`; a bare
//! `null` against a JSON field is rejected as ambiguous.

use schema::{Cardinality, Entity, Field, Relation, ScalarKind, Value};
use serde_json::{Map, Value as Json};
use storage::{
    CompareOp, Condition, FieldFilter, Filter, JsonCondition, JsonOp, JsonTarget, Quantifier, Record, RelationFilter,
    TextOp,
};

use crate::plan::{at, Planner};
use crate::QueryError;

/// A filter naming at least one complete unique constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueWhere {
    /// Values of every unique constraint named in the filter.
    pub values: Record,
    /// Additional non-unique conditions.
    pub rest: Filter,
}

impl UniqueWhere {
    pub fn to_filter(&self) -> Filter {
        Filter::and(vec![Filter::matching(&self.values), self.rest.clone()])
    }
}

const SENTINEL: &str = "$null";

impl Planner<'_> {
    /// Resolve a `where` object of `entity`.
    pub fn parse_filter(&self, entity: &Entity, json: &Json, path: &str) -> Result<Filter, QueryError> {
        self.filter_at(entity, json, path, 1)
    }

    fn filter_at(&self, entity: &Entity, json: &Json, path: &str, depth: usize) -> Result<Filter, QueryError> {
        if depth > self.config.max_depth {
            return Err(QueryError::validation(
                &entity.name,
                path,
                format!("filter nesting exceeds the maximum depth of {}", self.config.max_depth),
            ));
        }
        let map = json
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected a filter object"))?;

        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            let here = at(path, key);
            let part = match key.as_str() {
                "AND" => Filter::And(self.filter_list(entity, value, &here, depth)?),
                "OR" => Filter::Or(self.filter_list(entity, value, &here, depth)?),
                "NOT" => Filter::Not(self.filter_list(entity, value, &here, depth)?),
                name => {
                    if let Some(field) = entity.field(name) {
                        let (conditions, insensitive) = self.field_conditions(&entity.name, field, value, &here)?;
                        Filter::Field(FieldFilter {
                            field: field.name.clone(),
                            conditions,
                            insensitive,
                        })
                    } else if let Some(relation) = entity.relation(name) {
                        self.relation_filter(entity, relation, value, &here, depth)?
                    } else {
                        return Err(QueryError::validation(
                            &entity.name,
                            &here,
                            format!("unknown field or relation '{name}' on {}", entity.name),
                        ));
                    }
                }
            };
            parts.push(part);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Filter::And(parts)
        })
    }

    fn filter_list(&self, entity: &Entity, json: &Json, path: &str, depth: usize) -> Result<Vec<Filter>, QueryError> {
        match json {
            Json::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.filter_at(entity, item, &format!("{path}[{i}]"), depth + 1))
                .collect(),
            Json::Object(_) => Ok(vec![self.filter_at(entity, json, path, depth + 1)?]),
            _ => Err(QueryError::validation(&entity.name, path, "expected a filter object or a list of them")),
        }
    }

    // -----------------------------------------------------------------------
    // Field conditions
    // -----------------------------------------------------------------------

    /// Conditions for one field plus the case-insensitivity flag.
    pub(crate) fn field_conditions(
        &self,
        entity: &str,
        field: &Field,
        json: &Json,
        path: &str,
    ) -> Result<(Vec<Condition>, bool), QueryError> {
        if field.kind == ScalarKind::Json {
            return Ok((self.json_conditions(entity, field, json, path)?, false));
        }
        if field.list {
            return Ok((self.list_conditions(entity, field, json, path)?, false));
        }
        let Json::Object(ops) = json else {
            return Ok((vec![Condition::Equals(self.filter_value(entity, field, json, path)?)], false));
        };

        let mut conditions = Vec::with_capacity(ops.len());
        let mut insensitive = false;
        for (op, operand) in ops {
            let here = at(path, op);
            let unsupported = || {
                QueryError::validation(
                    entity,
                    &here,
                    format!("operator '{op}' is not valid for {} field '{}'", field.kind.label(), field.name),
                )
            };
            let condition = match op.as_str() {
                "equals" => Condition::Equals(self.filter_value(entity, field, operand, &here)?),
                "in" | "notIn" if field.kind != ScalarKind::Boolean => {
                    let values = self.element_list(entity, &field.kind, operand, &here)?;
                    if op == "in" {
                        Condition::In(values)
                    } else {
                        Condition::NotIn(values)
                    }
                }
                "lt" | "lte" | "gt" | "gte" if is_comparable(&field.kind) => {
                    Condition::Compare(compare_op(op), self.element(entity, &field.kind, operand, &here)?)
                }
                "contains" | "startsWith" | "endsWith" if field.kind == ScalarKind::String => Condition::Text {
                    op: text_op(op),
                    needle: operand
                        .as_str()
                        .ok_or_else(|| QueryError::validation(entity, &here, "expected a string"))?
                        .to_owned(),
                },
                "mode" if field.kind == ScalarKind::String => {
                    insensitive = match operand.as_str() {
                        Some("insensitive") => true,
                        Some("default") => false,
                        _ => {
                            return Err(QueryError::validation(
                                entity,
                                &here,
                                "mode must be \"default\" or \"insensitive\"",
                            ))
                        }
                    };
                    continue;
                }
                "not" => match operand {
                    Json::Object(_) => {
                        let (inner, nested_insensitive) = self.field_conditions(entity, field, operand, &here)?;
                        insensitive |= nested_insensitive;
                        Condition::Not(inner)
                    }
                    _ => Condition::Not(vec![Condition::Equals(self.filter_value(entity, field, operand, &here)?)]),
                },
                _ => return Err(unsupported()),
            };
            conditions.push(condition);
        }
        Ok((conditions, insensitive))
    }

    fn list_conditions(&self, entity: &str, field: &Field, json: &Json, path: &str) -> Result<Vec<Condition>, QueryError> {
        let Json::Object(ops) = json else {
            return Ok(vec![Condition::Equals(self.filter_value(entity, field, json, path)?)]);
        };
        let mut conditions = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let here = at(path, op);
            conditions.push(match op.as_str() {
                "equals" => Condition::Equals(self.filter_value(entity, field, operand, &here)?),
                "has" => Condition::Has(self.element(entity, &field.kind, operand, &here)?),
                "hasEvery" => Condition::HasEvery(self.element_list(entity, &field.kind, operand, &here)?),
                "hasSome" => Condition::HasSome(self.element_list(entity, &field.kind, operand, &here)?),
                "isEmpty" => Condition::IsEmpty(
                    operand
                        .as_bool()
                        .ok_or_else(|| QueryError::validation(entity, &here, "expected a boolean"))?,
                ),
                _ => {
                    return Err(QueryError::validation(
                        entity,
                        &here,
                        format!("operator '{op}' is not valid for list field '{}'", field.name),
                    ))
                }
            });
        }
        Ok(conditions)
    }

    fn json_conditions(&self, entity: &str, field: &Field, json: &Json, path: &str) -> Result<Vec<Condition>, QueryError> {
        let ops = match json {
            Json::Object(ops) if !is_sentinel(ops) => ops,
            _ => {
                return Err(QueryError::validation(
                    entity,
                    path,
                    format!("JSON field '{}' takes an operator object such as {{\"equals\": ...}}", field.name),
                ))
            }
        };
        let json_path = match ops.get("path") {
            None => Vec::new(),
            Some(Json::Array(keys)) => keys
                .iter()
                .map(|k| k.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| QueryError::validation(entity, &at(path, "path"), "path must be a list of strings"))?,
            Some(_) => {
                return Err(QueryError::validation(entity, &at(path, "path"), "path must be a list of strings"))
            }
        };

        let mut conditions = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            if op == "path" {
                continue;
            }
            let here = at(path, op);
            let string = || {
                operand
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| QueryError::validation(entity, &here, "expected a string"))
            };
            let document = || {
                if operand.is_null() {
                    Err(QueryError::validation(entity, &here, "expected a JSON value, got null"))
                } else {
                    Ok(operand.clone())
                }
            };
            let op = match op.as_str() {
                "equals" => JsonOp::Equals(json_target(entity, operand, &here)?),
                "not" => JsonOp::Not(json_target(entity, operand, &here)?),
                "string_contains" => JsonOp::StringContains(string()?),
                "string_starts_with" => JsonOp::StringStartsWith(string()?),
                "string_ends_with" => JsonOp::StringEndsWith(string()?),
                "array_contains" => JsonOp::ArrayContains(document()?),
                "array_starts_with" => JsonOp::ArrayStartsWith(document()?),
                "array_ends_with" => JsonOp::ArrayEndsWith(document()?),
                "lt" | "lte" | "gt" | "gte" => {
                    if !(operand.is_number() || operand.is_string()) {
                        return Err(QueryError::validation(entity, &here, "expected a number or a string"));
                    }
                    JsonOp::Compare(compare_op(op), operand.clone())
                }
                other => {
                    return Err(QueryError::validation(
                        entity,
                        &here,
                        format!("operator '{other}' is not valid for JSON field '{}'", field.name),
                    ))
                }
            };
            conditions.push(Condition::Json(JsonCondition {
                path: json_path.clone(),
                op,
            }));
        }
        Ok(conditions)
    }

    // -----------------------------------------------------------------------
    // Relations
    // -----------------------------------------------------------------------

    fn relation_filter(
        &self,
        entity: &Entity,
        relation: &Relation,
        json: &Json,
        path: &str,
        depth: usize,
    ) -> Result<Filter, QueryError> {
        let target = self.target(entity, relation, path)?;
        let join = self.join(entity, relation, path)?;
        let quantified = |quantifier, filter| {
            Filter::Relation(RelationFilter {
                join: join.clone(),
                quantifier,
                filter: Box::new(filter),
            })
        };

        if relation.cardinality == Cardinality::Many {
            let map = json.as_object().ok_or_else(|| {
                QueryError::validation(&entity.name, path, "to-many relation filters take every, some or none")
            })?;
            let mut parts = Vec::with_capacity(map.len());
            for (key, value) in map {
                let here = at(path, key);
                let quantifier = match key.as_str() {
                    "some" => Quantifier::Some,
                    "every" => Quantifier::Every,
                    "none" => Quantifier::None,
                    other => {
                        return Err(QueryError::validation(
                            &entity.name,
                            &here,
                            format!("'{other}' is not a to-many quantifier; use every, some or none"),
                        ))
                    }
                };
                parts.push(quantified(quantifier, self.filter_at(target, value, &here, depth + 1)?));
            }
            return Ok(Filter::and(parts));
        }

        let optional = self.registry.is_optional(entity, relation);
        let absent_allowed = |here: &str| {
            if optional {
                Ok(())
            } else {
                Err(QueryError::validation(
                    &entity.name,
                    here,
                    format!("required relation '{}' cannot be tested for null", relation.name),
                ))
            }
        };

        let map = match json {
            Json::Null => {
                absent_allowed(path)?;
                return Ok(quantified(Quantifier::None, Filter::all()));
            }
            Json::Object(map) => map,
            _ => return Err(QueryError::validation(&entity.name, path, "expected a relation filter object")),
        };

        if !map.keys().any(|k| k == "is" || k == "isNot") {
            return Ok(quantified(Quantifier::Some, self.filter_at(target, json, path, depth + 1)?));
        }
        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            let here = at(path, key);
            let part = match (key.as_str(), value) {
                ("is", Json::Null) => {
                    absent_allowed(&here)?;
                    quantified(Quantifier::None, Filter::all())
                }
                ("is", _) => quantified(Quantifier::Some, self.filter_at(target, value, &here, depth + 1)?),
                ("isNot", Json::Null) => {
                    absent_allowed(&here)?;
                    quantified(Quantifier::Some, Filter::all())
                }
                ("isNot", _) => quantified(Quantifier::None, self.filter_at(target, value, &here, depth + 1)?),
                (other, _) => {
                    return Err(QueryError::validation(
                        &entity.name,
                        &here,
                        format!("'{other}' cannot be combined with is/isNot"),
                    ))
                }
            };
            parts.push(part);
        }
        Ok(Filter::and(parts))
    }

    // -----------------------------------------------------------------------
    // Unique filters
    // -----------------------------------------------------------------------

    /// Resolve a filter that must name at least one complete unique constraint.
    ///
    /// With `exact` the filter must consist of exactly one constraint and
    /// nothing else (`cursor`, `connect`).
    pub fn parse_unique(&self, entity: &Entity, json: &Json, path: &str, exact: bool) -> Result<UniqueWhere, QueryError> {
        let map = json
            .as_object()
            .ok_or_else(|| QueryError::validation(&entity.name, path, "expected a unique filter object"))?;

        let mut values = Record::new();
        let mut found = 0usize;
        let mut rest = Map::new();
        for (key, value) in map {
            let here = at(path, key);
            let compound = entity
                .unique_constraints()
                .find(|c| c.fields.len() > 1 && c.name == *key);
            if let Some(constraint) = compound {
                let members = value.as_object().ok_or_else(|| {
                    QueryError::validation(
                        &entity.name,
                        &here,
                        format!("'{key}' takes an object of {}", constraint.fields.join(", ")),
                    )
                })?;
                if let Some(extra) = members.keys().find(|k| !constraint.fields.contains(k)) {
                    return Err(QueryError::validation(
                        &entity.name,
                        &at(&here, extra),
                        format!("'{extra}' is not part of unique constraint '{key}'"),
                    ));
                }
                for name in &constraint.fields {
                    let member = members.get(name).ok_or_else(|| {
                        QueryError::validation(&entity.name, &here, format!("missing '{name}' of unique constraint '{key}'"))
                    })?;
                    let field = entity.field(name).ok_or_else(|| {
                        QueryError::validation(&entity.name, &here, format!("unknown field '{name}'"))
                    })?;
                    values.insert(name.clone(), self.key_value(&entity.name, field, member, &at(&here, name))?);
                }
                found += 1;
                continue;
            }

            let single = entity
                .unique_constraints()
                .any(|c| c.fields.len() == 1 && c.fields[0] == *key);
            if single && !value.is_object() {
                if let Some(field) = entity.field(key) {
                    values.insert(key.clone(), self.key_value(&entity.name, field, value, &here)?);
                    found += 1;
                    continue;
                }
            }

            if exact {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("'{key}' is not a unique constraint of {}", entity.name),
                ));
            }
            rest.insert(key.clone(), value.clone());
        }

        if found == 0 {
            let names: Vec<&str> = entity.unique_constraints().map(|c| c.name.as_str()).collect();
            return Err(QueryError::validation(
                &entity.name,
                path,
                format!("expected exactly one of the unique constraints: {}", names.join(", ")),
            ));
        }
        if exact && found > 1 {
            return Err(QueryError::validation(&entity.name, path, "expected exactly one unique constraint"));
        }
        let rest = if rest.is_empty() {
            Filter::all()
        } else {
            self.filter_at(entity, &Json::Object(rest), path, 1)?
        };
        Ok(UniqueWhere { values, rest })
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    /// A value compared against `field`; `null` only for nullable fields.
    fn filter_value(&self, entity: &str, field: &Field, json: &Json, path: &str) -> Result<Value, QueryError> {
        if json.is_null() && !field.nullable {
            return Err(QueryError::validation(
                entity,
                path,
                format!("field '{}' is not nullable", field.name),
            ));
        }
        self.registry
            .parse_value(field, json)
            .map_err(|e| QueryError::validation(entity, path, e.to_string()))
    }

    /// A non-null unique key value.
    fn key_value(&self, entity: &str, field: &Field, json: &Json, path: &str) -> Result<Value, QueryError> {
        self.element(entity, &field.kind, json, path)
    }

    /// A single non-null scalar of `kind`.
    pub(crate) fn element(&self, entity: &str, kind: &ScalarKind, json: &Json, path: &str) -> Result<Value, QueryError> {
        self.registry
            .parse_element(kind, json)
            .map_err(|e| QueryError::validation(entity, path, e.to_string()))
    }

    fn element_list(&self, entity: &str, kind: &ScalarKind, json: &Json, path: &str) -> Result<Vec<Value>, QueryError> {
        let items = json
            .as_array()
            .ok_or_else(|| QueryError::validation(entity, path, "expected a list"))?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.element(entity, kind, item, &format!("{path}[{i}]")))
            .collect()
    }
}

fn is_comparable(kind: &ScalarKind) -> bool {
    matches!(
        kind,
        ScalarKind::String | ScalarKind::Int | ScalarKind::Float | ScalarKind::Decimal | ScalarKind::DateTime
    )
}

fn compare_op(op: &str) -> CompareOp {
    match op {
        "lt" => CompareOp::Lt,
        "lte" => CompareOp::Lte,
        "gt" => CompareOp::Gt,
        _ => CompareOp::Gte,
    }
}

fn text_op(op: &str) -> TextOp {
    match op {
        "contains" => TextOp::Contains,
        "startsWith" => TextOp::StartsWith,
        _ => TextOp::EndsWith,
    }
}

pub(crate) fn is_sentinel(map: &Map<String, Json>) -> bool {
    map.len() == 1 && map.contains_key(SENTINEL)
}

/// Parse a JSON null sentinel: `Some(target)` when `json` is one.
pub(crate) fn null_sentinel(entity: &str, json: &Json, path: &str) -> Result<Option<JsonTarget>, QueryError> {
    let Json::Object(map) = json else {
        return Ok(None);
    };
    if !is_sentinel(map) {
        return Ok(None);
    }
    match map.get(SENTINEL).and_then(Json::as_str) {
        Some("db") => Ok(Some(JsonTarget::DbNull)),
        Some("json") => Ok(Some(JsonTarget::JsonNull)),
        Some("any") => Ok(Some(JsonTarget::AnyNull)),
        _ => Err(QueryError::validation(
            entity,
            path,
            "\"$null\" must be \"db\", \"json\" or \"any\"",
        )),
    }
}

fn json_target(entity: &str, json: &Json, path: &str) -> Result<JsonTarget, QueryError> {
    if json.is_null() {
        return Err(QueryError::validation(
            entity,
            path,
            "null is ambiguous for JSON fields; use {\"$null\": \"db\" | \"json\" | \"any\"}",
        ));
    }
    Ok(null_sentinel(entity, json, path)?.unwrap_or_else(|| JsonTarget::Value(json.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientConfig;
    use schema::platform::platform_registry;
    use serde_json::json;

    fn with_planner<T>(f: impl FnOnce(&Planner<'_>, &schema::SchemaRegistry) -> T) -> T {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let planner = Planner::new(&registry, &config);
        f(&planner, &registry)
    }

    fn validation_path(err: QueryError) -> String {
        match err {
            QueryError::Validation { path, .. } => path,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn scalar_shorthand_is_equals() {
        with_planner(|planner, registry| {
            let user = registry.entity("User").unwrap();
            let filter = planner.parse_filter(user, &json!({"email": "a@x.com"}), "where").unwrap();
            assert_eq!(
                filter,
                Filter::Field(FieldFilter::new("email", vec![Condition::Equals(Value::from("a@x.com"))]))
            );
        });
    }

    #[test]
    fn bad_operator_reports_the_full_path() {
        with_planner(|planner, registry| {
            let user = registry.entity("User").unwrap();
            let err = planner
                .parse_filter(user, &json!({"workflows": {"some": {"status": {"gt": "IDLE"}}}}), "where")
                .unwrap_err();
            assert_eq!(validation_path(err), "where.workflows.some.status.gt");
        });
    }

    #[test]
    fn unknown_fields_are_rejected() {
        with_planner(|planner, registry| {
            let user = registry.entity("User").unwrap();
            let err = planner.parse_filter(user, &json!({"password": "x"}), "where").unwrap_err();
            assert_eq!(validation_path(err), "where.password");
        });
    }

    #[test]
    fn insensitive_mode_is_recorded_on_the_field() {
        with_planner(|planner, registry| {
            let user = registry.entity("User").unwrap();
            let filter = planner
                .parse_filter(user, &json!({"name": {"contains": "ann", "mode": "insensitive"}}), "where")
                .unwrap();
            let Filter::Field(field) = filter else { panic!("expected a field filter") };
            assert!(field.insensitive);
            assert_eq!(field.conditions.len(), 1);
        });
    }

    #[test]
    fn bare_null_on_json_fields_is_ambiguous() {
        with_planner(|planner, registry| {
            let run = registry.entity("WorkflowRun").unwrap();
            assert!(planner.parse_filter(run, &json!({"output": null}), "where").is_err());
            assert!(planner.parse_filter(run, &json!({"output": {"equals": null}}), "where").is_err());

            let filter = planner
                .parse_filter(run, &json!({"output": {"equals": {"$null": "json"}}}), "where")
                .unwrap();
            let Filter::Field(field) = filter else { panic!("expected a field filter") };
            assert_eq!(
                field.conditions,
                vec![Condition::Json(JsonCondition {
                    path: vec![],
                    op: JsonOp::Equals(JsonTarget::JsonNull),
                })]
            );
        });
    }

    #[test]
    fn required_to_one_relations_reject_null_tests() {
        with_planner(|planner, registry| {
            let workflow = registry.entity("Workflow").unwrap();
            assert!(planner.parse_filter(workflow, &json!({"template": null}), "where").is_ok());
            let err = planner.parse_filter(workflow, &json!({"user": {"is": null}}), "where").unwrap_err();
            assert_eq!(validation_path(err), "where.user.is");
        });
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig {
            max_depth: 2,
            ..ClientConfig::default()
        };
        let planner = Planner::new(&registry, &config);
        let user = registry.entity("User").unwrap();
        assert!(planner.parse_filter(user, &json!({"AND": [{"email": "a"}]}), "where").is_ok());
        assert!(planner
            .parse_filter(user, &json!({"AND": [{"OR": [{"email": "a"}]}]}), "where")
            .is_err());
    }

    #[test]
    fn unique_filters_accept_compound_names() {
        with_planner(|planner, registry| {
            let credential = registry.entity("Credential").unwrap();
            let unique = planner
                .parse_unique(
                    credential,
                    &json!({"userId_name": {"userId": "u1", "name": "gmail"}}),
                    "where",
                    true,
                )
                .unwrap();
            assert_eq!(unique.values.len(), 2);
            assert!(unique.rest.is_trivial());

            let err = planner
                .parse_unique(credential, &json!({"name": "gmail"}), "where", false)
                .unwrap_err();
            assert_eq!(validation_path(err), "where");
        });
    }

    #[test]
    fn unique_filters_keep_extra_conditions_unless_exact() {
        with_planner(|planner, registry| {
            let user = registry.entity("User").unwrap();
            let args = json!({"id": "u1", "name": "Ann"});
            let unique = planner.parse_unique(user, &args, "where", false).unwrap();
            assert!(!unique.rest.is_trivial());
            assert!(planner.parse_unique(user, &args, "cursor", true).is_err());
        });
    }
}
