//! Projection Resolver: `select` / `include` / `omit` into a concrete output
//! [`Shape`].

use schema::{Cardinality, Entity, Join};
use serde_json::{Map, Value as Json};
use storage::Filter;

use crate::descriptor::FindArgs;
use crate::plan::{at, Planner};
use crate::query::ScopedRead;
use crate::QueryError;

/// Parsed projection of one entity. `select` excludes `include` and `omit`,
/// so the two modes are separate variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Select(Vec<(String, Member)>),
    Defaults {
        include: Vec<(String, Member)>,
        /// `(field, omitted)`; `false` re-enables a globally omitted field.
        omit: Vec<(String, bool)>,
    },
}

/// One selected or included member.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Scalar,
    Relation(Box<FindArgs>),
    Count(Json),
}

/// Output of a read: which scalars, relations and relation counts to return.
#[derive(Debug, Clone)]
pub(crate) struct Shape {
    pub entity: String,
    /// In declaration order.
    pub scalars: Vec<String>,
    pub relations: Vec<RelationShape>,
    pub counts: Vec<CountShape>,
}

#[derive(Debug, Clone)]
pub(crate) struct RelationShape {
    pub name: String,
    pub join: Join,
    pub to_many: bool,
    pub read: ScopedRead,
    pub shape: Shape,
}

#[derive(Debug, Clone)]
pub(crate) struct CountShape {
    pub name: String,
    pub join: Join,
    pub filter: Filter,
}

impl Planner<'_> {
    /// Parse `select` / `include` / `omit` of `entity`.
    pub fn parse_projection(
        &self,
        entity: &Entity,
        select: Option<&Json>,
        include: Option<&Json>,
        omit: Option<&Json>,
        path: &str,
    ) -> Result<Projection, QueryError> {
        match (select, include, omit) {
            (Some(_), Some(_), _) => Err(QueryError::validation(
                &entity.name,
                &at(path, "select"),
                "select and include cannot be used together",
            )),
            (Some(_), None, Some(_)) => Err(QueryError::validation(
                &entity.name,
                &at(path, "select"),
                "select and omit cannot be used together",
            )),
            (Some(select), None, None) => {
                Ok(Projection::Select(self.members(entity, select, &at(path, "select"), true)?))
            }
            (None, include, omit) => {
                let include = match include {
                    Some(json) => self.members(entity, json, &at(path, "include"), false)?,
                    None => Vec::new(),
                };
                let omit = match omit {
                    Some(json) => self.omissions(entity, json, &at(path, "omit"))?,
                    None => Vec::new(),
                };
                Ok(Projection::Defaults { include, omit })
            }
        }
    }

    fn members(
        &self,
        entity: &Entity,
        json: &Json,
        path: &str,
        scalars_allowed: bool,
    ) -> Result<Vec<(String, Member)>, QueryError> {
        let map = object(entity, json, path)?;
        let mut members = Vec::with_capacity(map.len());
        for (key, value) in map {
            let here = at(path, key);
            if *value == Json::Bool(false) {
                continue;
            }
            let member = if key == "_count" {
                Member::Count(value.clone())
            } else if entity.field(key).is_some() {
                if !scalars_allowed {
                    return Err(QueryError::validation(
                        &entity.name,
                        &here,
                        format!("include only accepts relations; '{key}' is a field"),
                    ));
                }
                if *value != Json::Bool(true) {
                    return Err(QueryError::validation(&entity.name, &here, "fields are selected with true"));
                }
                Member::Scalar
            } else if entity.relation(key).is_some() {
                match value {
                    Json::Bool(true) => Member::Relation(Box::default()),
                    Json::Object(_) => Member::Relation(Box::new(crate::descriptor::parse_args(
                        &entity.name,
                        &here,
                        value,
                    )?)),
                    _ => {
                        return Err(QueryError::validation(
                            &entity.name,
                            &here,
                            "relations are selected with true or an object",
                        ))
                    }
                }
            } else {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("unknown field or relation '{key}' on {}", entity.name),
                ));
            };
            members.push((key.clone(), member));
        }
        Ok(members)
    }

    fn omissions(&self, entity: &Entity, json: &Json, path: &str) -> Result<Vec<(String, bool)>, QueryError> {
        let map = object(entity, json, path)?;
        let mut omit = Vec::with_capacity(map.len());
        for (key, value) in map {
            let here = at(path, key);
            if entity.relation(key).is_some() {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("relation '{key}' cannot be omitted"),
                ));
            }
            if entity.field(key).is_none() {
                return Err(QueryError::validation(
                    &entity.name,
                    &here,
                    format!("unknown field '{key}' on {}", entity.name),
                ));
            }
            let flag = value
                .as_bool()
                .ok_or_else(|| QueryError::validation(&entity.name, &here, "expected true or false"))?;
            omit.push((key.clone(), flag));
        }
        Ok(omit)
    }

    /// Resolve the output shape of `entity`.
    pub(crate) fn shape(
        &self,
        entity: &Entity,
        select: Option<&Json>,
        include: Option<&Json>,
        omit: Option<&Json>,
        path: &str,
        depth: usize,
    ) -> Result<Shape, QueryError> {
        self.check_depth(entity, path, depth)?;
        let projection = self.parse_projection(entity, select, include, omit, path)?;
        let (scalars, members, members_path) = match &projection {
            Projection::Select(members) => {
                let scalars: Vec<String> = entity
                    .fields
                    .iter()
                    .filter(|f| members.iter().any(|(name, m)| *m == Member::Scalar && *name == f.name))
                    .map(|f| f.name.clone())
                    .collect();
                (scalars, members.as_slice(), at(path, "select"))
            }
            Projection::Defaults { include, omit } => {
                let global = self.config.omitted(&entity.name);
                let scalars: Vec<String> = entity
                    .fields
                    .iter()
                    .filter(|f| {
                        match omit.iter().find(|(name, _)| *name == f.name) {
                            Some((_, omitted)) => !omitted,
                            None => !global.contains(&f.name),
                        }
                    })
                    .map(|f| f.name.clone())
                    .collect();
                (scalars, include.as_slice(), at(path, "include"))
            }
        };

        let mut shape = Shape {
            entity: entity.name.clone(),
            scalars,
            relations: Vec::new(),
            counts: Vec::new(),
        };
        for (name, member) in members {
            let here = at(&members_path, name);
            match member {
                Member::Scalar => {}
                Member::Relation(args) => shape.relations.push(self.relation_shape(entity, name, args, &here, depth)?),
                Member::Count(json) => shape.counts = self.count_shapes(entity, json, &here)?,
            }
        }
        Ok(shape)
    }

    fn relation_shape(
        &self,
        entity: &Entity,
        name: &str,
        args: &FindArgs,
        path: &str,
        depth: usize,
    ) -> Result<RelationShape, QueryError> {
        let relation = entity.relation(name).ok_or_else(|| {
            QueryError::validation(&entity.name, path, format!("unknown relation '{name}'"))
        })?;
        let target = self.target(entity, relation, path)?;
        let join = self.join(entity, relation, path)?;
        let to_many = relation.cardinality == Cardinality::Many;
        if !to_many && args.has_read_scope() {
            return Err(QueryError::validation(
                &entity.name,
                path,
                format!("to-one relation '{name}' only accepts select, include and omit"),
            ));
        }
        let read = if to_many {
            self.scoped_read(target, args, path)?
        } else {
            ScopedRead::default()
        };
        let shape = self.shape(
            target,
            args.select.as_ref(),
            args.include.as_ref(),
            args.omit.as_ref(),
            path,
            depth + 1,
        )?;
        Ok(RelationShape {
            name: name.to_owned(),
            join,
            to_many,
            read,
            shape,
        })
    }

    /// `_count: true` counts every to-many relation; `_count: {select: {...}}`
    /// names relations, each with an optional `where`.
    fn count_shapes(&self, entity: &Entity, json: &Json, path: &str) -> Result<Vec<CountShape>, QueryError> {
        let to_many = entity
            .relations
            .iter()
            .filter(|r| r.cardinality == Cardinality::Many);
        if *json == Json::Bool(true) {
            return to_many
                .map(|relation| {
                    self.join(entity, relation, path).map(|join| CountShape {
                        name: relation.name.clone(),
                        join,
                        filter: Filter::all(),
                    })
                })
                .collect();
        }

        let map = object(entity, json, path)?;
        let select_path = at(path, "select");
        if let Some(extra) = map.keys().find(|k| *k != "select") {
            return Err(QueryError::validation(
                &entity.name,
                &at(path, extra),
                "_count only accepts select",
            ));
        }
        let selected = object(
            entity,
            map.get("select")
                .ok_or_else(|| QueryError::validation(&entity.name, path, "expected true or {select: {...}}"))?,
            &select_path,
        )?;

        let mut counts = Vec::with_capacity(selected.len());
        for (name, value) in selected {
            let here = at(&select_path, name);
            let relation = entity
                .relation(name)
                .filter(|r| r.cardinality == Cardinality::Many)
                .ok_or_else(|| {
                    QueryError::validation(&entity.name, &here, format!("'{name}' is not a to-many relation"))
                })?;
            let filter = match value {
                Json::Bool(true) => Filter::all(),
                Json::Bool(false) => continue,
                Json::Object(inner) => {
                    if let Some(extra) = inner.keys().find(|k| *k != "where") {
                        return Err(QueryError::validation(
                            &entity.name,
                            &at(&here, extra),
                            "relation counts only accept where",
                        ));
                    }
                    match inner.get("where") {
                        Some(filter) => {
                            let target = self.target(entity, relation, &here)?;
                            self.parse_filter(target, filter, &at(&here, "where"))?
                        }
                        None => Filter::all(),
                    }
                }
                _ => return Err(QueryError::validation(&entity.name, &here, "expected true or {where: ...}")),
            };
            counts.push(CountShape {
                name: name.clone(),
                join: self.join(entity, relation, &here)?,
                filter,
            });
        }
        Ok(counts)
    }
}

fn object<'j>(entity: &Entity, json: &'j Json, path: &str) -> Result<&'j Map<String, Json>, QueryError> {
    json.as_object()
        .ok_or_else(|| QueryError::validation(&entity.name, path, "expected an object"))
}
