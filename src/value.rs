//! Property values shared by both backends
//!
//! Entities carry their kind-specific data as a `Properties` map. Values keep
//! enough type information to order consistently across the document store,
//! to bind as SQL parameters, and to render as JSON for clients.

use crate::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Date format used in SQL columns and client JSON.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Datetime format of SQL `DATETIME` columns.
pub const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Strict ISO 8601 UTC datetime format accepted from and sent to clients.
pub const ISO_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Kind-specific data of an entity, keyed by property name.
pub type Properties = BTreeMap<String, Value>;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Ordering rank of the value's type. Values of different types sort by
    /// rank; numbers compare with each other regardless of representation.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Json(_) => 6,
            Value::List(_) => 7,
        }
    }

    /// Total order used for sorting and cursor positions.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.sort_cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Equality as a store filter sees it: numbers compare by value and a
    /// list property matches when any element does.
    pub fn filter_matches(&self, wanted: &Value) -> bool {
        match self {
            Value::List(items) if !matches!(wanted, Value::List(_)) => {
                items.iter().any(|item| item.filter_matches(wanted))
            }
            _ => self.sort_cmp(wanted) == Ordering::Equal,
        }
    }

    /// Interpret client JSON. Objects stay JSON, arrays become lists.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }

    /// Render for clients. Dates and datetimes become ISO 8601 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => (*b).into(),
            Value::Int(i) => (*i).into(),
            Value::Float(f) => (*f).into(),
            Value::Text(s) => s.clone().into(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string().into(),
            Value::Timestamp(t) => t.format(ISO_DATETIME_FORMAT).to_string().into(),
            Value::Json(j) => j.clone(),
            Value::List(items) => items.iter().map(Value::to_json).collect(),
        }
    }

    /// Short human-readable rendering for tables and logs.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            other => match other.to_json() {
                serde_json::Value::String(s) => s,
                json => json.to_string(),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Date(d) => ToSqlOutput::Owned(SqlValue::Text(d.format(DATE_FORMAT).to_string())),
            Value::Timestamp(t) => {
                ToSqlOutput::Owned(SqlValue::Text(t.format(SQL_DATETIME_FORMAT).to_string()))
            }
            Value::Json(j) => ToSqlOutput::Owned(SqlValue::Text(j.to_string())),
            Value::List(_) => ToSqlOutput::Owned(SqlValue::Text(self.to_json().to_string())),
        })
    }
}

/// Declared type of a property, used to coerce text from query strings and
/// rows from SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Bool,
    Int,
    Float,
    Text,
    Json,
    Date,
    Datetime,
    List,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Bool => "bool",
            PropertyType::Int => "int",
            PropertyType::Float => "float",
            PropertyType::Text => "text",
            PropertyType::Json => "json",
            PropertyType::Date => "date",
            PropertyType::Datetime => "datetime",
            PropertyType::List => "list",
        }
    }

    /// Coerce a raw query-string value.
    ///
    /// `'false'` and the empty string are false; any other text is true.
    /// Empty dates and datetimes are null.
    pub fn coerce(&self, raw: &str) -> Result<Value> {
        let invalid = |what: &str| Error::Validation(format!("Invalid {} value: {:?}", what, raw));
        Ok(match self {
            PropertyType::Bool => Value::Bool(!(raw.is_empty() || raw == "false")),
            PropertyType::Int => Value::Int(raw.parse().map_err(|_| invalid("int"))?),
            PropertyType::Float => Value::Float(raw.parse().map_err(|_| invalid("float"))?),
            PropertyType::Text => Value::Text(raw.to_string()),
            PropertyType::Json => serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::Json)
                .map_err(|_| invalid("json"))?,
            PropertyType::Date if raw.is_empty() => Value::Null,
            PropertyType::Date => Value::Date(
                NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| invalid("date"))?,
            ),
            PropertyType::Datetime if raw.is_empty() => Value::Null,
            PropertyType::Datetime => Value::Timestamp(
                NaiveDateTime::parse_from_str(raw, ISO_DATETIME_FORMAT)
                    .map_err(|_| invalid("datetime"))?,
            ),
            PropertyType::List => Value::Text(raw.to_string()),
        })
    }

    /// Coerce a client JSON value to this type. Strings are parsed the way
    /// query-string values are.
    pub fn coerce_json(&self, json: serde_json::Value) -> Result<Value> {
        match (self, json) {
            (_, serde_json::Value::Null) => Ok(Value::Null),
            (PropertyType::Json, obj) => Ok(Value::Json(obj)),
            (PropertyType::Float, serde_json::Value::Number(n)) => {
                Ok(Value::Float(n.as_f64().unwrap_or_default()))
            }
            (PropertyType::Text | PropertyType::List, other) => Ok(Value::from_json(other)),
            (ty, serde_json::Value::String(s)) => ty.coerce(&s),
            (_, other) => Ok(Value::from_json(other)),
        }
    }
}

/// Maximum serialized length of a JSON property.
pub const JSON_MAX_LENGTH: usize = 16_000;
/// Maximum number of keys in a JSON object property.
pub const JSON_MAX_KEYS: usize = 100;
/// Maximum serialized length of any single JSON object value.
pub const JSON_MAX_VALUE_LENGTH: usize = 10_000;

/// Enforce size limits on a JSON property before it is written.
pub fn check_json_limits(property: &str, json: &serde_json::Value) -> Result<()> {
    let text = json.to_string();
    if text.len() > JSON_MAX_LENGTH {
        return Err(Error::Validation(format!(
            "{}: JSON is {} characters, limit is {}",
            property,
            text.len(),
            JSON_MAX_LENGTH
        )));
    }
    if let serde_json::Value::Object(map) = json {
        if map.len() > JSON_MAX_KEYS {
            return Err(Error::Validation(format!(
                "{}: JSON has {} keys, limit is {}",
                property,
                map.len(),
                JSON_MAX_KEYS
            )));
        }
        for (key, value) in map {
            let len = value.to_string().len();
            if len > JSON_MAX_VALUE_LENGTH {
                return Err(Error::Validation(format!(
                    "{}.{}: value is {} characters, limit is {}",
                    property, key, len, JSON_MAX_VALUE_LENGTH
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sort_order_across_types() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Int(3),
            Value::Null,
            Value::Float(2.5),
            Value::Bool(true),
            Value::Text("a".into()),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Float(2.5),
                Value::Int(3),
                Value::Text("a".into()),
                Value::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_list_filter_matches_any_element() {
        let tags = Value::List(vec!["red".into(), "blue".into()]);
        assert!(tags.filter_matches(&"blue".into()));
        assert!(!tags.filter_matches(&"green".into()));
        assert!(Value::Int(2).filter_matches(&Value::Float(2.0)));
    }

    #[test]
    fn test_bool_coercion() {
        assert_eq!(PropertyType::Bool.coerce("false").unwrap(), Value::Bool(false));
        assert_eq!(PropertyType::Bool.coerce("").unwrap(), Value::Bool(false));
        assert_eq!(PropertyType::Bool.coerce("true").unwrap(), Value::Bool(true));
        assert_eq!(PropertyType::Bool.coerce("0").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_date_coercion() {
        assert_eq!(
            PropertyType::Date.coerce("2024-02-29").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(PropertyType::Date.coerce("29/02/2024").is_err());
        assert_eq!(PropertyType::Datetime.coerce("").unwrap(), Value::Null);
        let ts = PropertyType::Datetime.coerce("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(ts.to_json(), json!("2024-01-02T03:04:05Z"));
    }

    #[test]
    fn test_json_round_trip_through_from_json() {
        let value = Value::from_json(json!({"a": [1, 2]}));
        assert!(matches!(value, Value::Json(_)));
        assert_eq!(value.to_json(), json!({"a": [1, 2]}));
        assert_eq!(Value::from_json(json!([1, "x"])), Value::List(vec![Value::Int(1), "x".into()]));
    }

    #[test]
    fn test_json_limits() {
        assert!(check_json_limits("meta", &json!({"a": 1})).is_ok());

        let too_many: serde_json::Map<String, serde_json::Value> =
            (0..101).map(|i| (format!("k{}", i), json!(i))).collect();
        assert!(check_json_limits("meta", &serde_json::Value::Object(too_many)).is_err());

        let long_value = json!({"a": "x".repeat(10_001)});
        assert!(check_json_limits("meta", &long_value).is_err());

        let too_long = json!(["y".repeat(16_001)]);
        assert!(check_json_limits("meta", &too_long).is_err());
    }
}
