//! The process-wide, read-only Schema Registry.
//!
//! Built once at start-up through [`RegistryBuilder::build`], which checks
//! every structural invariant the query engine relies on:
//! 1. Entity, field and relation names are unique and never start with `_`.
//! 2. Every entity has exactly one identity of required scalar fields.
//! 3. Unique constraints reference declared scalar fields.
//! 4. Owned relations point at a unique key of their target with matching kinds.
//! 5. Inverse relations name an owned relation pointing back; inverse to-one
//!    relations require a unique foreign key on the owner.

use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;
use tracing::debug;

use crate::model::{Cardinality, Entity, Field, Join, ReferentialAction, Relation, RelationLink, ScalarKind};
use crate::{SchemaError, Value, ValueError};

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: Vec<Entity>,
    enums: Vec<(String, Vec<String>)>,
}

impl RegistryBuilder {
    pub fn enumeration(mut self, name: impl Into<String>, variants: &[&str]) -> Self {
        self.enums
            .push((name.into(), variants.iter().map(|v| v.to_string()).collect()));
        self
    }

    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate the collected declarations and freeze them into a registry.
    pub fn build(self) -> Result<SchemaRegistry, SchemaError> {
        let mut index = HashMap::new();
        for (pos, entity) in self.entities.iter().enumerate() {
            if index.insert(entity.name.clone(), pos).is_some() {
                return Err(SchemaError::DuplicateEntity(entity.name.clone()));
            }
        }

        let mut registry = SchemaRegistry {
            entities: self.entities,
            index,
            enums: self.enums.into_iter().collect(),
        };
        registry.resolve_referential_actions();

        for entity in &registry.entities {
            registry.check_members(entity)?;
            registry.check_identity(entity)?;
            registry.check_uniques(entity)?;
            for relation in &entity.relations {
                registry.check_relation(entity, relation)?;
            }
        }

        debug!(entities = registry.entities.len(), "schema registry built");
        Ok(registry)
    }
}

/// Immutable description of every entity, relation and enum.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    enums: HashMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&Entity, SchemaError> {
        self.index
            .get(name)
            .map(|&pos| &self.entities[pos])
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_owned()))
    }

    /// Entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn enum_variants(&self, name: &str) -> Option<&[String]> {
        self.enums.get(name).map(Vec::as_slice)
    }

    /// Convert caller JSON into a value for `field`, honouring list-ness.
    ///
    /// `null` is returned as [`Value::Null`] without a nullability check.
    pub fn parse_value(&self, field: &Field, json: &Json) -> Result<Value, ValueError> {
        if !field.list || json.is_null() {
            return self.parse_scalar(&field.kind, json);
        }
        let items = json.as_array().ok_or_else(|| ValueError::TypeMismatch {
            expected: format!("{}[]", field.kind.label()),
            found: crate::value::json_type_name(json).to_owned(),
        })?;
        items
            .iter()
            .map(|item| self.parse_element(&field.kind, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }

    /// Convert a single scalar of `kind`.
    pub fn parse_scalar(&self, kind: &ScalarKind, json: &Json) -> Result<Value, ValueError> {
        let variants = match kind {
            ScalarKind::Enum { name } => self.enum_variants(name),
            _ => None,
        };
        Value::from_json(kind, json, variants)
    }

    /// Like [`parse_scalar`](Self::parse_scalar) but rejects `null`, for list elements.
    pub fn parse_element(&self, kind: &ScalarKind, json: &Json) -> Result<Value, ValueError> {
        if json.is_null() {
            return Err(ValueError::TypeMismatch {
                expected: kind.label().to_owned(),
                found: "null".to_owned(),
            });
        }
        self.parse_scalar(kind, json)
    }

    /// Column pairs connecting `entity` rows to the rows of `relation.target`.
    pub fn join(&self, entity: &Entity, relation: &Relation) -> Result<Join, SchemaError> {
        match &relation.link {
            RelationLink::Owned { fields, references, .. } => Ok(Join {
                target: relation.target.clone(),
                local: fields.clone(),
                remote: references.clone(),
            }),
            RelationLink::Inverse { inverse } => {
                let owner = self.entity(&relation.target)?;
                match owner.relation(inverse).map(|r| &r.link) {
                    Some(RelationLink::Owned { fields, references, .. }) => Ok(Join {
                        target: relation.target.clone(),
                        local: references.clone(),
                        remote: fields.clone(),
                    }),
                    _ => Err(SchemaError::InvalidRelation {
                        entity: entity.name.clone(),
                        relation: relation.name.clone(),
                        reason: format!("'{}.{inverse}' is not an owned relation", owner.name),
                    }),
                }
            }
        }
    }

    /// True when a to-one relation may be absent.
    pub fn is_optional(&self, entity: &Entity, relation: &Relation) -> bool {
        match (&relation.link, relation.cardinality) {
            (_, Cardinality::Many) => true,
            (RelationLink::Owned { fields, .. }, Cardinality::One) => fields
                .iter()
                .all(|f| entity.field(f).map_or(true, |field| field.nullable)),
            (RelationLink::Inverse { .. }, Cardinality::One) => true,
        }
    }

    /// Every owned relation, across all entities, that points at `target`.
    pub fn dependents(&self, target: &str) -> Vec<(&Entity, &Relation)> {
        self.entities
            .iter()
            .flat_map(|e| e.relations.iter().map(move |r| (e, r)))
            .filter(|(_, r)| r.is_owned() && r.target == target)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internal: build-time checks
    // -----------------------------------------------------------------------

    fn resolve_referential_actions(&mut self) {
        for entity in &mut self.entities {
            let nullable: HashSet<String> = entity
                .fields
                .iter()
                .filter(|f| f.nullable)
                .map(|f| f.name.clone())
                .collect();
            for relation in &mut entity.relations {
                if let RelationLink::Owned { fields, on_delete, .. } = &mut relation.link {
                    if on_delete.is_none() {
                        let optional = !fields.is_empty() && fields.iter().all(|f| nullable.contains(f));
                        *on_delete = Some(if optional {
                            ReferentialAction::SetNull
                        } else {
                            ReferentialAction::Restrict
                        });
                    }
                }
            }
        }
    }

    fn check_members(&self, entity: &Entity) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        let names = entity
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(entity.relations.iter().map(|r| r.name.as_str()));
        for name in names {
            if name.starts_with('_') {
                return Err(SchemaError::ReservedName {
                    entity: entity.name.clone(),
                    name: name.to_owned(),
                });
            }
            if !seen.insert(name) {
                return Err(SchemaError::DuplicateMember {
                    entity: entity.name.clone(),
                    name: name.to_owned(),
                });
            }
        }
        for field in &entity.fields {
            if let ScalarKind::Enum { name } = &field.kind {
                if !self.enums.contains_key(name) {
                    return Err(SchemaError::UnknownEnum {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_identity(&self, entity: &Entity) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidIdentity {
            entity: entity.name.clone(),
            reason,
        };
        if entity.identity.fields.is_empty() {
            return Err(invalid("identity has no fields".into()));
        }
        for name in &entity.identity.fields {
            let field = entity
                .field(name)
                .ok_or_else(|| invalid(format!("unknown field '{name}'")))?;
            if field.nullable || field.list || field.kind == ScalarKind::Json {
                return Err(invalid(format!(
                    "field '{name}' must be a required, single-valued, non-JSON scalar"
                )));
            }
        }
        Ok(())
    }

    fn check_uniques(&self, entity: &Entity) -> Result<(), SchemaError> {
        let mut names = HashSet::new();
        for constraint in entity.unique_constraints() {
            let invalid = |reason: String| SchemaError::InvalidUnique {
                entity: entity.name.clone(),
                constraint: constraint.name.clone(),
                reason,
            };
            if constraint.fields.is_empty() {
                return Err(invalid("constraint has no fields".into()));
            }
            if !names.insert(constraint.name.as_str()) {
                return Err(invalid("constraint is declared twice".into()));
            }
            for name in &constraint.fields {
                match entity.field(name) {
                    None => return Err(invalid(format!("unknown field '{name}'"))),
                    Some(f) if f.list || f.kind == ScalarKind::Json => {
                        return Err(invalid(format!("field '{name}' cannot be part of a unique key")))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    fn check_relation(&self, entity: &Entity, relation: &Relation) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidRelation {
            entity: entity.name.clone(),
            relation: relation.name.clone(),
            reason,
        };
        let target = self
            .entity(&relation.target)
            .map_err(|_| invalid(format!("unknown target entity '{}'", relation.target)))?;

        match &relation.link {
            RelationLink::Owned { fields, references, on_delete } => {
                if relation.cardinality != Cardinality::One {
                    return Err(invalid("owned relations must be to-one".into()));
                }
                if fields.is_empty() || fields.len() != references.len() {
                    return Err(invalid("fields and references must pair up".into()));
                }
                let mut nullable = Vec::with_capacity(fields.len());
                for (local, remote) in fields.iter().zip(references) {
                    let lf = entity
                        .field(local)
                        .ok_or_else(|| invalid(format!("unknown field '{local}'")))?;
                    let rf = target
                        .field(remote)
                        .ok_or_else(|| invalid(format!("unknown referenced field '{}.{remote}'", target.name)))?;
                    if lf.kind != rf.kind || lf.list || rf.list {
                        return Err(invalid(format!("'{local}' and '{}.{remote}' have different kinds", target.name)));
                    }
                    nullable.push(lf.nullable);
                }
                if nullable.iter().any(|n| *n) && !nullable.iter().all(|n| *n) {
                    return Err(invalid("foreign key fields must be all nullable or all required".into()));
                }
                if *on_delete == Some(ReferentialAction::SetNull) && !nullable[0] {
                    return Err(invalid("SetNull requires nullable foreign key fields".into()));
                }
                let covers = target
                    .unique_constraints()
                    .any(|c| same_set(&c.fields, references));
                if !covers {
                    return Err(invalid("referenced fields must form a unique constraint".into()));
                }
            }
            RelationLink::Inverse { inverse } => {
                let back = target
                    .relation(inverse)
                    .ok_or_else(|| invalid(format!("unknown inverse relation '{}.{inverse}'", target.name)))?;
                let RelationLink::Owned { fields, .. } = &back.link else {
                    return Err(invalid(format!("inverse '{}.{inverse}' must own the foreign key", target.name)));
                };
                if back.target != entity.name {
                    return Err(invalid(format!("inverse '{}.{inverse}' points elsewhere", target.name)));
                }
                if relation.cardinality == Cardinality::One
                    && !target.unique_constraints().any(|c| same_set(&c.fields, fields))
                {
                    return Err(invalid("one-to-one relations need a unique foreign key".into()));
                }
            }
        }
        Ok(())
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;
    use serde_json::json;

    fn user() -> Entity {
        Entity::new("User")
            .with_field(Field::new("id", ScalarKind::String))
            .with_field(Field::new("email", ScalarKind::String))
            .with_relation(Relation::has_many("posts", "Post", "author"))
            .with_unique(&["email"])
    }

    fn post() -> Entity {
        Entity::new("Post")
            .with_field(Field::new("id", ScalarKind::String))
            .with_field(Field::new("authorId", ScalarKind::String).optional())
            .with_relation(Relation::belongs_to("author", "User", &["authorId"], &["id"]))
    }

    #[test]
    fn join_is_resolved_from_both_sides() {
        let registry = SchemaRegistry::builder().entity(user()).entity(post()).build().unwrap();
        let user = registry.entity("User").unwrap();
        let join = registry.join(user, user.relation("posts").unwrap()).unwrap();
        assert_eq!(join.local, vec!["id"]);
        assert_eq!(join.remote, vec!["authorId"]);
        assert_eq!(join.reversed("User").local, vec!["authorId"]);
    }

    #[test]
    fn nullable_foreign_keys_default_to_set_null() {
        let registry = SchemaRegistry::builder().entity(user()).entity(post()).build().unwrap();
        let post = registry.entity("Post").unwrap();
        let author = post.relation("author").unwrap();
        assert_eq!(author.on_delete_action(), Some(ReferentialAction::SetNull));
        assert!(registry.is_optional(post, author));
        assert_eq!(registry.dependents("User").len(), 1);
    }

    #[test]
    fn duplicate_entities_are_rejected() {
        let err = SchemaRegistry::builder().entity(user()).entity(user()).build().unwrap_err();
        assert_eq!(err, SchemaError::DuplicateEntity("User".into()));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let bad = user().with_field(Field::new("_count", ScalarKind::Int));
        let err = SchemaRegistry::builder().entity(bad).entity(post()).build().unwrap_err();
        assert!(matches!(err, SchemaError::ReservedName { name, .. } if name == "_count"));
    }

    #[test]
    fn nullable_identity_is_rejected() {
        let bad = Entity::new("Tag").with_field(Field::new("id", ScalarKind::String).optional());
        let err = SchemaRegistry::builder().entity(bad).build().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentity { entity, .. } if entity == "Tag"));
    }

    #[test]
    fn relation_must_reference_a_unique_key() {
        let bad = Entity::new("Post")
            .with_field(Field::new("id", ScalarKind::String))
            .with_field(Field::new("authorEmail", ScalarKind::String))
            .with_relation(Relation::belongs_to("author", "User", &["authorEmail"], &["id"]))
            .with_relation(Relation::belongs_to("editor", "Tag", &["authorEmail"], &["id"]));
        let err = SchemaRegistry::builder().entity(user()).entity(bad).build().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidRelation { relation, .. } if relation == "editor"));
    }

    #[test]
    fn one_to_one_inverse_needs_unique_foreign_key() {
        let parent = user().with_relation(Relation::has_one("profile", "Post", "author"));
        let err = SchemaRegistry::builder().entity(parent).entity(post()).build().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidRelation { relation, .. } if relation == "profile"));
    }

    #[test]
    fn list_values_are_parsed_element_wise() {
        let registry = SchemaRegistry::builder()
            .enumeration("Provider", &["GOOGLE", "SLACK"])
            .build()
            .unwrap();
        let field = Field::new("providers", ScalarKind::Enum { name: "Provider".into() }).list();
        let parsed = registry.parse_value(&field, &json!(["GOOGLE", "SLACK"])).unwrap();
        assert_eq!(
            parsed,
            Value::List(vec![Value::Enum("GOOGLE".into()), Value::Enum("SLACK".into())])
        );
        assert!(registry.parse_value(&field, &json!(["GOOGLE", null])).is_err());
        assert!(registry.parse_value(&field, &json!("GOOGLE")).is_err());
    }
}
