//! `orderBy`, `cursor`, `skip`, `take` and `distinct`.

use schema::{Cardinality, Entity, ScalarKind};
use serde_json::Value as Json;
use storage::{Direction, NullsOrder, OrderBy, OrderKey, Window};

use crate::plan::{at, Planner};
use crate::QueryError;

/// Append the identity of `entity` (ascending) unless already ordered by it.
pub(crate) fn tiebreak(entity: &Entity, mut order: Vec<OrderBy>) -> Vec<OrderBy> {
    for field in &entity.identity.fields {
        let present = order
            .iter()
            .any(|o| matches!(&o.key, OrderKey::Field(name) if name == field));
        if !present {
            order.push(OrderBy::asc(field.clone()));
        }
    }
    order
}

pub(crate) fn parse_direction(entity: &str, json: &Json, path: &str) -> Result<Direction, QueryError> {
    match json.as_str() {
        Some("asc") => Ok(Direction::Asc),
        Some("desc") => Ok(Direction::Desc),
        _ => Err(QueryError::validation(entity, path, "sort order must be \"asc\" or \"desc\"")),
    }
}

/// The entries of an `orderBy` list, or the object itself, each with its path.
pub(crate) fn order_entries<'j>(
    entity: &str,
    json: &'j Json,
    path: &str,
) -> Result<Vec<(String, &'j String, &'j Json)>, QueryError> {
    match json {
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| single_key(entity, item, &format!("{path}[{i}]")))
            .collect(),
        _ => Ok(vec![single_key(entity, json, path)?]),
    }
}

/// The only key of an object and its value.
pub(crate) fn single_key<'j>(
    entity: &str,
    json: &'j Json,
    path: &str,
) -> Result<(String, &'j String, &'j Json), QueryError> {
    match json.as_object().filter(|map| map.len() == 1).and_then(|map| map.iter().next()) {
        Some((key, value)) => Ok((at(path, key), key, value)),
        None => Err(QueryError::validation(entity, path, "expected an object with exactly one key")),
    }
}

impl Planner<'_> {
    /// Resolve `orderBy` without the identity tie-breaker.
    pub(crate) fn parse_order_by(&self, entity: &Entity, json: Option<&Json>, path: &str) -> Result<Vec<OrderBy>, QueryError> {
        let Some(json) = json else {
            return Ok(Vec::new());
        };
        let mut order = Vec::new();
        for (here, key, value) in order_entries(&entity.name, json, path)? {
            order.push(self.order_entry(entity, key, value, &here)?);
        }
        Ok(order)
    }

    pub(crate) fn order_entry(&self, entity: &Entity, key: &str, value: &Json, path: &str) -> Result<OrderBy, QueryError> {
        if let Some(field) = entity.field(key) {
            if !field.is_orderable() {
                return Err(QueryError::validation(
                    &entity.name,
                    path,
                    format!("{} field '{key}' cannot be ordered by", field_kind(&field.kind, field.list)),
                ));
            }
            return match value {
                Json::Object(map) => {
                    let sort = map
                        .get("sort")
                        .ok_or_else(|| QueryError::validation(&entity.name, path, "missing 'sort'"))?;
                    let direction = parse_direction(&entity.name, sort, &at(path, "sort"))?;
                    let nulls = match map.get("nulls") {
                        None => None,
                        Some(_) if !field.nullable => {
                            return Err(QueryError::validation(
                                &entity.name,
                                &at(path, "nulls"),
                                format!("'{key}' is not nullable"),
                            ))
                        }
                        Some(nulls) => Some(match nulls.as_str() {
                            Some("first") => NullsOrder::First,
                            Some("last") => NullsOrder::Last,
                            _ => {
                                return Err(QueryError::validation(
                                    &entity.name,
                                    &at(path, "nulls"),
                                    "nulls must be \"first\" or \"last\"",
                                ))
                            }
                        }),
                    };
                    if let Some(extra) = map.keys().find(|k| *k != "sort" && *k != "nulls") {
                        return Err(QueryError::validation(
                            &entity.name,
                            &at(path, extra),
                            format!("unknown sort option '{extra}'"),
                        ));
                    }
                    Ok(OrderBy {
                        key: OrderKey::Field(key.to_owned()),
                        direction,
                        nulls,
                    })
                }
                _ => Ok(OrderBy {
                    key: OrderKey::Field(key.to_owned()),
                    direction: parse_direction(&entity.name, value, path)?,
                    nulls: None,
                }),
            };
        }

        let relation = entity.relation(key).ok_or_else(|| {
            QueryError::validation(&entity.name, path, format!("unknown field or relation '{key}' on {}", entity.name))
        })?;
        let join = self.join(entity, relation, path)?;
        let target = self.target(entity, relation, path)?;
        let (here, inner, value) = single_key(&entity.name, value, path)?;

        if relation.cardinality == Cardinality::Many {
            if inner != "_count" {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("to-many relation '{key}' can only be ordered by _count"),
                ));
            }
            return Ok(OrderBy {
                key: OrderKey::RelationCount(join),
                direction: parse_direction(&entity.name, value, &here)?,
                nulls: None,
            });
        }

        let field = target.field(inner).ok_or_else(|| {
            QueryError::validation(&entity.name, &here, format!("unknown field '{inner}' on {}", target.name))
        })?;
        if !field.is_orderable() {
            return Err(QueryError::validation(
                &entity.name,
                &here,
                format!("{} field '{inner}' cannot be ordered by", field_kind(&field.kind, field.list)),
            ));
        }
        Ok(OrderBy {
            key: OrderKey::RelatedField {
                join,
                field: field.name.clone(),
            },
            direction: parse_direction(&entity.name, value, &here)?,
            nulls: None,
        })
    }

    /// Resolve `cursor`, `skip`, `take` and `distinct`.
    pub(crate) fn parse_window(
        &self,
        entity: &Entity,
        cursor: Option<&Json>,
        skip: Option<i64>,
        take: Option<i64>,
        distinct: Option<&Json>,
        path: &str,
    ) -> Result<Window, QueryError> {
        let cursor = match cursor {
            Some(json) => Some(self.parse_unique(entity, json, &at(path, "cursor"), true)?.values),
            None => None,
        };
        let skip = match skip {
            Some(n) => u64::try_from(n)
                .map_err(|_| QueryError::validation(&entity.name, &at(path, "skip"), "skip must not be negative"))?,
            None => 0,
        };
        let distinct = match distinct {
            None => Vec::new(),
            Some(json) => self.distinct_fields(entity, json, &at(path, "distinct"))?,
        };
        Ok(Window {
            distinct,
            cursor,
            skip,
            take,
            partition: Vec::new(),
        })
    }

    fn distinct_fields(&self, entity: &Entity, json: &Json, path: &str) -> Result<Vec<String>, QueryError> {
        let names: Vec<&str> = match json {
            Json::String(name) => vec![name.as_str()],
            Json::Array(items) => items
                .iter()
                .map(Json::as_str)
                .collect::<Option<_>>()
                .ok_or_else(|| QueryError::validation(&entity.name, path, "expected field names"))?,
            _ => return Err(QueryError::validation(&entity.name, path, "expected a field name or a list of them")),
        };
        names
            .into_iter()
            .map(|name| match entity.field(name) {
                Some(field) if field.kind != ScalarKind::Json => Ok(field.name.clone()),
                Some(_) => Err(QueryError::validation(
                    &entity.name,
                    path,
                    format!("JSON field '{name}' cannot be distinct"),
                )),
                None => Err(QueryError::validation(
                    &entity.name,
                    path,
                    format!("unknown field '{name}' on {}", entity.name),
                )),
            })
            .collect()
    }
}

fn field_kind(kind: &ScalarKind, list: bool) -> String {
    if list {
        format!("list ({})", kind.label())
    } else {
        kind.label().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientConfig;
    use schema::platform::platform_registry;
    use serde_json::json;

    #[test]
    fn orders_accept_objects_lists_and_relations() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let planner = Planner::new(&registry, &config);
        let workflow = registry.entity("Workflow").unwrap();

        let order = planner
            .parse_order_by(
                workflow,
                Some(&json!([
                    {"name": "desc"},
                    {"lastRunAt": {"sort": "asc", "nulls": "first"}},
                    {"runs": {"_count": "desc"}},
                    {"user": {"email": "asc"}}
                ])),
                "orderBy",
            )
            .unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[1].nulls, Some(NullsOrder::First));
        assert!(matches!(order[2].key, OrderKey::RelationCount(_)));
        assert!(matches!(&order[3].key, OrderKey::RelatedField { field, .. } if field == "email"));

        let tied = tiebreak(workflow, order);
        assert_eq!(tied.last().unwrap().key, OrderKey::Field("id".into()));
    }

    #[test]
    fn unorderable_fields_and_bad_nulls_are_rejected() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let planner = Planner::new(&registry, &config);
        let workflow = registry.entity("Workflow").unwrap();

        for (order, path) in [
            (json!({"config": "asc"}), "orderBy.config"),
            (json!({"cronExpressions": "asc"}), "orderBy.cronExpressions"),
            (json!({"name": {"sort": "asc", "nulls": "last"}}), "orderBy.name.nulls"),
            (json!({"name": "up"}), "orderBy.name"),
            (json!({"name": "asc", "id": "asc"}), "orderBy"),
        ] {
            let err = planner.parse_order_by(workflow, Some(&order), "orderBy").unwrap_err();
            assert!(matches!(err, QueryError::Validation { path: p, .. } if p == path), "{order}");
        }
    }

    #[test]
    fn windows_reject_negative_skip() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig::default();
        let planner = Planner::new(&registry, &config);
        let user = registry.entity("User").unwrap();

        let window = planner
            .parse_window(user, Some(&json!({"id": "u2"})), Some(1), Some(-2), Some(&json!("email")), "")
            .unwrap();
        assert_eq!(window.cursor.unwrap()["id"], schema::Value::from("u2"));
        assert_eq!(window.take, Some(-2));
        assert_eq!(window.distinct, vec!["email".to_string()]);

        assert!(planner.parse_window(user, None, Some(-1), None, None, "").is_err());
    }
}
