//! Operation descriptors.
//!
//! A caller describes an operation as `{"entity", "operation", "args"}`. The
//! `args` object is deserialised into the argument struct of its operation;
//! unknown keys are rejected so typos never silently widen a query.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Count,
    Aggregate,
    GroupBy,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    UpdateManyAndReturn,
    Upsert,
    Delete,
    DeleteMany,
}

impl Operation {
    pub const ALL: [Operation; 17] = [
        Operation::FindUnique,
        Operation::FindUniqueOrThrow,
        Operation::FindFirst,
        Operation::FindFirstOrThrow,
        Operation::FindMany,
        Operation::Count,
        Operation::Aggregate,
        Operation::GroupBy,
        Operation::Create,
        Operation::CreateMany,
        Operation::CreateManyAndReturn,
        Operation::Update,
        Operation::UpdateMany,
        Operation::UpdateManyAndReturn,
        Operation::Upsert,
        Operation::Delete,
        Operation::DeleteMany,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindUnique          => "findUnique",
            Self::FindUniqueOrThrow   => "findUniqueOrThrow",
            Self::FindFirst           => "findFirst",
            Self::FindFirstOrThrow    => "findFirstOrThrow",
            Self::FindMany            => "findMany",
            Self::Count               => "count",
            Self::Aggregate           => "aggregate",
            Self::GroupBy             => "groupBy",
            Self::Create              => "create",
            Self::CreateMany          => "createMany",
            Self::CreateManyAndReturn => "createManyAndReturn",
            Self::Update              => "update",
            Self::UpdateMany          => "updateMany",
            Self::UpdateManyAndReturn => "updateManyAndReturn",
            Self::Upsert              => "upsert",
            Self::Delete              => "delete",
            Self::DeleteMany          => "deleteMany",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::CreateMany
                | Self::CreateManyAndReturn
                | Self::Update
                | Self::UpdateMany
                | Self::UpdateManyAndReturn
                | Self::Upsert
                | Self::Delete
                | Self::DeleteMany
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation: {s}"))
    }
}

/// One operation against one entity, as read from a descriptor file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub entity: String,
    pub operation: Operation,
    #[serde(default)]
    pub args: Json,
}

// ---------------------------------------------------------------------------
// Per-operation arguments
// ---------------------------------------------------------------------------

/// `findMany`, `findFirst` and nested to-many selections.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FindArgs {
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
    pub order_by: Option<Json>,
    pub cursor: Option<Json>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    pub distinct: Option<Json>,
}

impl FindArgs {
    /// True when any key besides the projection keys is present.
    pub fn has_read_scope(&self) -> bool {
        self.filter.is_some()
            || self.order_by.is_some()
            || self.cursor.is_some()
            || self.take.is_some()
            || self.skip.is_some()
            || self.distinct.is_some()
    }
}

/// `findUnique`, `findUniqueOrThrow` and `delete`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UniqueArgs {
    #[serde(rename = "where")]
    pub filter: Json,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CountArgs {
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    pub order_by: Option<Json>,
    pub cursor: Option<Json>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    pub distinct: Option<Json>,
}

/// The aggregate selections shared by `aggregate` and `groupBy`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateArgs {
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<Json>,
    pub cursor: Option<Json>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    #[serde(rename = "_count")]
    pub count: Option<Json>,
    #[serde(rename = "_min")]
    pub min: Option<Json>,
    #[serde(rename = "_max")]
    pub max: Option<Json>,
    #[serde(rename = "_avg")]
    pub avg: Option<Json>,
    #[serde(rename = "_sum")]
    pub sum: Option<Json>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupByArgs {
    pub by: Json,
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    pub having: Option<Json>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<Json>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    #[serde(rename = "_count")]
    pub count: Option<Json>,
    #[serde(rename = "_min")]
    pub min: Option<Json>,
    #[serde(rename = "_max")]
    pub max: Option<Json>,
    #[serde(rename = "_avg")]
    pub avg: Option<Json>,
    #[serde(rename = "_sum")]
    pub sum: Option<Json>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateArgs {
    pub data: Json,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

/// `createMany` and `createManyAndReturn`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateManyArgs {
    pub data: Json,
    #[serde(default)]
    pub skip_duplicates: bool,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateArgs {
    #[serde(rename = "where")]
    pub filter: Json,
    pub data: Json,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

/// `updateMany` and `updateManyAndReturn`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateManyArgs {
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    pub data: Json,
    pub limit: Option<i64>,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpsertArgs {
    #[serde(rename = "where")]
    pub filter: Json,
    pub create: Json,
    pub update: Json,
    pub select: Option<Json>,
    pub include: Option<Json>,
    pub omit: Option<Json>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteManyArgs {
    #[serde(rename = "where")]
    pub filter: Option<Json>,
    pub limit: Option<i64>,
}

/// Deserialise `args` (a missing `args` reads as `{}`).
pub(crate) fn parse_args<T: DeserializeOwned>(entity: &str, path: &str, args: &Json) -> Result<T, QueryError> {
    let args = if args.is_null() {
        Json::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| QueryError::validation(entity, path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operations_round_trip_through_names() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
            assert_eq!(serde_json::to_value(op).unwrap(), json!(op.as_str()));
        }
        assert!("findAll".parse::<Operation>().is_err());
    }

    #[test]
    fn unknown_argument_keys_are_rejected() {
        let err = parse_args::<FindArgs>("User", "args", &json!({"wehre": {}})).unwrap_err();
        assert!(matches!(err, QueryError::Validation { message, .. } if message.contains("wehre")));
    }

    #[test]
    fn descriptors_default_to_empty_args() {
        let d: Descriptor = serde_json::from_value(json!({"entity": "User", "operation": "findMany"})).unwrap();
        assert_eq!(d.operation, Operation::FindMany);
        assert!(parse_args::<FindArgs>(&d.entity, "args", &d.args).is_ok());
    }
}
