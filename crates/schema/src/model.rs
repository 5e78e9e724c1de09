//! Entity, field and relation descriptions.
//!
//! These are *schema* models: they describe the shape of rows and how
//! entities reference each other. Rows themselves are maps of [`Value`]s.

use serde::Serialize;

use crate::Value;

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Scalar kind of a field (or of each element of a list field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalarKind {
    String,
    Int,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Json,
    Enum { name: String },
}

impl ScalarKind {
    pub fn label(&self) -> &str {
        match self {
            Self::String => "String",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::Decimal => "Decimal",
            Self::Boolean => "Boolean",
            Self::DateTime => "DateTime",
            Self::Json => "Json",
            Self::Enum { name } => name,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Decimal)
    }
}

/// Value assigned to a field when a create payload leaves it out.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// A fresh UUID v4 rendered as a string.
    Uuid,
    /// The current UTC time.
    Now,
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: ScalarKind,
    pub list: bool,
    pub nullable: bool,
    pub default: Option<FieldDefault>,
    /// Set to the current time on every write.
    pub updated_at: bool,
}

impl Field {
    /// A required, single-valued field.
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            list: false,
            nullable: false,
            default: None,
            updated_at: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    pub fn default_to(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn updated_at(mut self) -> Self {
        self.updated_at = true;
        self
    }

    /// Numeric, single-valued: eligible for `_avg`/`_sum` and atomic arithmetic.
    pub fn is_numeric(&self) -> bool {
        !self.list && self.kind.is_numeric()
    }

    /// Fields that can appear in `orderBy`, `_min` and `_max`.
    pub fn is_orderable(&self) -> bool {
        !self.list && !matches!(self.kind, ScalarKind::Json)
    }
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// What happens to dependent rows when the row they reference is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationLink {
    /// This entity holds the foreign key.
    Owned {
        fields: Vec<String>,
        references: Vec<String>,
        /// `None` until the registry resolves the default for the relation.
        on_delete: Option<ReferentialAction>,
    },
    /// The target holds the foreign key through its relation named `inverse`.
    Inverse { inverse: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub link: RelationLink,
}

impl Relation {
    /// To-one relation owned by this entity.
    ///
    /// Unless [`Relation::on_delete`] is called, the registry picks `Restrict`
    /// for required foreign keys and `SetNull` for nullable ones.
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        fields: &[&str],
        references: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::One,
            link: RelationLink::Owned {
                fields: fields.iter().map(|f| f.to_string()).collect(),
                references: references.iter().map(|f| f.to_string()).collect(),
                on_delete: None,
            },
        }
    }

    /// To-many side of a relation owned by `target.inverse`.
    pub fn has_many(name: impl Into<String>, target: impl Into<String>, inverse: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Many,
            link: RelationLink::Inverse { inverse: inverse.into() },
        }
    }

    /// Optional one-to-one parent side; the target holds a unique foreign key.
    pub fn has_one(name: impl Into<String>, target: impl Into<String>, inverse: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::One,
            link: RelationLink::Inverse { inverse: inverse.into() },
        }
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let RelationLink::Owned { on_delete, .. } = &mut self.link {
            *on_delete = Some(action);
        }
        self
    }

    /// On-delete action of an owned relation.
    pub fn on_delete_action(&self) -> Option<ReferentialAction> {
        match &self.link {
            RelationLink::Owned { on_delete, .. } => *on_delete,
            RelationLink::Inverse { .. } => None,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.link, RelationLink::Owned { .. })
    }
}

/// Column pairs connecting a row of one entity to rows of `target`.
///
/// `local[i]` on the source row equals `remote[i]` on the target row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Join {
    pub target: String,
    pub local: Vec<String>,
    pub remote: Vec<String>,
}

impl Join {
    /// The same join seen from the target entity back to `source`.
    pub fn reversed(&self, source: &str) -> Join {
        Join {
            target: source.to_owned(),
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniqueConstraint {
    /// Field names joined by `_`, e.g. `userId_name`.
    pub name: String,
    pub fields: Vec<String>,
}

impl UniqueConstraint {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            name: fields.join("_"),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub fields: Vec<Field>,
    pub relations: Vec<Relation>,
    pub identity: UniqueConstraint,
    /// Unique constraints besides the identity.
    pub uniques: Vec<UniqueConstraint>,
}

impl Entity {
    /// Start an entity whose identity is a single `id` field declared later.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            identity: UniqueConstraint::new(&["id"]),
            uniques: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_identity(mut self, fields: &[&str]) -> Self {
        self.identity = UniqueConstraint::new(fields);
        self
    }

    pub fn with_unique(mut self, fields: &[&str]) -> Self {
        self.uniques.push(UniqueConstraint::new(fields));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Identity first, then the declared unique constraints.
    pub fn unique_constraints(&self) -> impl Iterator<Item = &UniqueConstraint> {
        std::iter::once(&self.identity).chain(self.uniques.iter())
    }

    pub fn constraint(&self, name: &str) -> Option<&UniqueConstraint> {
        self.unique_constraints().find(|c| c.name == name)
    }
}
