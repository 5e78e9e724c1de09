//! Typed scalar values stored in rows and carried by filters.
//!
//! SQL `NULL` is [`Value::Null`]; a JSON document that happens to be `null`
//! is `Value::Json(serde_json::Value::Null)`. The two never compare equal.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value as Json;

use crate::model::ScalarKind;
use crate::ValueError;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    DateTime(DateTime<Utc>),
    Json(Json),
    Enum(String),
    List(Vec<Value>),
}

impl Value {
    /// Convert caller JSON into a value of the given scalar kind.
    ///
    /// `variants` must be supplied for enum kinds. A JSON `null` always maps
    /// to [`Value::Null`]; nullability is the caller's concern.
    pub fn from_json(
        kind: &ScalarKind,
        json: &Json,
        variants: Option<&[String]>,
    ) -> Result<Value, ValueError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || ValueError::TypeMismatch {
            expected: kind.label().to_owned(),
            found: json_type_name(json).to_owned(),
        };
        match kind {
            ScalarKind::String => json.as_str().map(|s| Value::String(s.to_owned())).ok_or_else(mismatch),
            ScalarKind::Int => json.as_i64().map(Value::Int).ok_or_else(mismatch),
            ScalarKind::Float => json.as_f64().map(Value::Float).ok_or_else(mismatch),
            ScalarKind::Boolean => json.as_bool().map(Value::Boolean).ok_or_else(mismatch),
            ScalarKind::Decimal => {
                let text = match json {
                    Json::Number(n) => n.to_string(),
                    Json::String(s) => s.clone(),
                    _ => return Err(mismatch()),
                };
                Decimal::from_str(&text)
                    .map(Value::Decimal)
                    .map_err(|_| ValueError::InvalidLiteral { kind: "decimal", value: text })
            }
            ScalarKind::DateTime => {
                let text = json.as_str().ok_or_else(mismatch)?;
                parse_datetime(text)
                    .map(Value::DateTime)
                    .ok_or_else(|| ValueError::InvalidLiteral {
                        kind: "datetime",
                        value: text.to_owned(),
                    })
            }
            ScalarKind::Json => Ok(Value::Json(json.clone())),
            ScalarKind::Enum { name } => {
                let text = json.as_str().ok_or_else(mismatch)?;
                let known = variants.map_or(false, |v| v.iter().any(|variant| variant == text));
                if known {
                    Ok(Value::Enum(text.to_owned()))
                } else {
                    Err(ValueError::UnknownVariant {
                        name: name.clone(),
                        value: text.to_owned(),
                    })
                }
            }
        }
    }

    /// Render the value the way results are returned to callers.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::Decimal(d) => Json::String(d.normalize().to_string()),
            Value::String(s) | Value::Enum(s) => Json::String(s.clone()),
            Value::DateTime(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Json(j) => j.clone(),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Ordering between two values of compatible kinds.
    ///
    /// Numbers compare across Int/Float/Decimal. Returns `None` for NULL and
    /// for kinds with no meaningful order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&Decimal::from(*b))),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal::from(*a).cmp(b)),
            (Value::Int(_) | Value::Float(_) | Value::Decimal(_), Value::Int(_) | Value::Float(_) | Value::Decimal(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Value::String(a), Value::String(b)) | (Value::Enum(a), Value::Enum(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => compare_json(a, b),
            _ => None,
        }
    }

    /// Equality used by filters: numeric kinds compare by magnitude, everything
    /// else structurally.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Int(_) | Value::Float(_) | Value::Decimal(_), _) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) | (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => float_bits(*f).hash(state),
            Value::Decimal(d) => d.normalize().hash(state),
            Value::String(s) | Value::Enum(s) => s.hash(state),
            Value::DateTime(t) => t.hash(state),
            Value::Json(j) => j.to_string().hash(state),
            Value::List(items) => items.hash(state),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Short name of a JSON value's type, used in mismatch messages.
pub fn json_type_name(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Ordering for JSON documents: numbers and strings only.
pub fn compare_json(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Timestamps are kept at millisecond precision, the precision they are
/// rendered with.
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc).trunc_subsecs(3));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// -0.0 and 0.0 must hash alike because they compare equal.
fn float_bits(f: f64) -> u64 {
    if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sql_null_and_json_null_are_distinct() {
        let db_null = Value::from_json(&ScalarKind::Json, &Json::Null, None).unwrap();
        assert_eq!(db_null, Value::Null);
        assert_ne!(Value::Json(Json::Null), Value::Null);
    }

    #[test]
    fn numbers_compare_across_kinds() {
        let dec = Value::Decimal(Decimal::from_str("2.50").unwrap());
        assert_eq!(Value::Int(2).compare(&dec), Some(Ordering::Less));
        assert_eq!(Value::Float(2.5).compare(&dec), Some(Ordering::Equal));
        assert!(Value::Int(3).loosely_equals(&Value::Float(3.0)));
        assert!(!Value::Int(3).loosely_equals(&Value::Null));
    }

    #[test]
    fn enum_literals_must_be_declared() {
        let kind = ScalarKind::Enum { name: "RunStatus".into() };
        let variants = vec!["STARTED".to_string(), "FAILED".to_string()];
        assert_eq!(
            Value::from_json(&kind, &json!("FAILED"), Some(&variants)).unwrap(),
            Value::Enum("FAILED".into())
        );
        assert!(matches!(
            Value::from_json(&kind, &json!("PAUSED"), Some(&variants)),
            Err(ValueError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn datetimes_accept_rfc3339_and_plain_dates() {
        let kind = ScalarKind::DateTime;
        let full = Value::from_json(&kind, &json!("2025-03-01T10:00:00Z"), None).unwrap();
        let date = Value::from_json(&kind, &json!("2025-03-01"), None).unwrap();
        assert_eq!(full.compare(&date), Some(Ordering::Greater));
        assert_eq!(date.to_json(), json!("2025-03-01T00:00:00.000Z"));
    }

    #[test]
    fn datetimes_keep_millisecond_precision() {
        let kind = ScalarKind::DateTime;
        let fine = Value::from_json(&kind, &json!("2025-03-01T10:00:00.123456789Z"), None).unwrap();
        let coarse = Value::from_json(&kind, &json!("2025-03-01T10:00:00.123Z"), None).unwrap();
        assert_eq!(fine, coarse);
        assert_eq!(Value::from_json(&kind, &fine.to_json(), None).unwrap(), fine);
    }

    #[test]
    fn decimals_render_as_strings() {
        let v = Value::from_json(&ScalarKind::Decimal, &json!("12.50"), None).unwrap();
        assert_eq!(v.to_json(), json!("12.5"));
        assert!(Value::from_json(&ScalarKind::Decimal, &json!(true), None).is_err());
    }
}
