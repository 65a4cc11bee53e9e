//! Dynamically typed cells and arguments exchanged with the backing engine.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Serialize, Serializer};
use std::{error::Error as StdError, fmt};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

type BoxError = Box<dyn StdError + Sync + Send>;

/// A single dynamically typed value.
///
/// `Optional(None)` is the absent marker: it travels to the engine as a typed
/// "no value" for an optional parameter slot and is never confused with a
/// missing key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Optional(Option<Box<Value>>),
}

/// Concrete type a value resolves to once nulls and optionals are peeled off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn absent() -> Self {
        Value::Optional(None)
    }

    /// Strips `Optional` wrappers; `None` for null and absent values.
    pub fn resolved(&self) -> Option<&Value> {
        match self {
            Value::Null | Value::Optional(None) => None,
            Value::Optional(Some(inner)) => inner.resolved(),
            other => Some(other),
        }
    }

    pub fn is_null(&self) -> bool {
        self.resolved().is_none()
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null | Value::Optional(None) => None,
            Value::Optional(Some(inner)) => inner.kind(),
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Float(_) => Some(ValueKind::Float),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.resolved() {
            Some(Value::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.resolved() {
            Some(Value::Float(v)) => Some(*v),
            Some(Value::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Converts a JSON argument value. Arrays and objects have no counterpart.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(format!("number {n} is out of range"))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(_) => Err("array values are not supported".to_string()),
            serde_json::Value::Object(_) => Err("object values are not supported".to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null | Value::Optional(None) => f.write_str("null"),
            Value::Optional(Some(inner)) => inner.fmt(f),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null | Value::Optional(None) => serializer.serialize_none(),
            Value::Optional(Some(inner)) => inner.serialize(serializer),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

// Encodes against whatever type the server declared for the slot; nulls and
// absent markers fit any slot.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let Some(value) = self.resolved() else {
            return Ok(IsNull::Yes);
        };

        match value {
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT8 => i.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                _ if is_text(ty) => i.to_string().to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ if is_text(ty) => v.to_string().to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Value::Text(s) => match *ty {
                Type::BOOL => s.parse::<bool>()?.to_sql(ty, out),
                Type::INT2 => s.parse::<i16>()?.to_sql(ty, out),
                Type::INT4 => s.parse::<i32>()?.to_sql(ty, out),
                Type::INT8 => s.parse::<i64>()?.to_sql(ty, out),
                Type::FLOAT4 => s.parse::<f32>()?.to_sql(ty, out),
                Type::FLOAT8 => s.parse::<f64>()?.to_sql(ty, out),
                Type::NUMERIC => s.parse::<Decimal>()?.to_sql(ty, out),
                Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)?
                    .with_timezone(&Utc)
                    .to_sql(ty, out),
                Type::TIMESTAMP => DateTime::parse_from_rfc3339(s)?
                    .naive_utc()
                    .to_sql(ty, out),
                Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
                _ if is_text(ty) => s.as_str().to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Value::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.to_sql(ty, out),
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                _ if is_text(ty) => ts.to_rfc3339().to_sql(ty, out),
                _ => Err(mismatch(value, ty)),
            },
            Value::Null | Value::Optional(_) => Ok(IsNull::Yes),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    let kind = value.kind().map(|k| k.as_str()).unwrap_or("null");
    format!("cannot bind {kind} argument to parameter of type {ty}").into()
}

// NUMERIC surfaces as a float; text only if it cannot be represented.
fn numeric_value(decimal: Decimal) -> Value {
    decimal
        .to_f64()
        .map(Value::Float)
        .unwrap_or_else(|| Value::Text(decimal.to_string()))
}

/// Decodes column `idx` of a driver row into a [`Value`].
pub fn from_row(row: &tokio_postgres::Row, idx: usize) -> Result<Value, String> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let decoded = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::Bool)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(|i| Value::Int(i.into()))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(|i| Value::Int(i.into()))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::Int)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|f| Value::Float(f.into()))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::Float)),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)
            .map(|v| v.map(numeric_value)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map(Value::Timestamp)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map(|ts| Value::Timestamp(ts.and_utc()))),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(|id| Value::Text(id.to_string()))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map(|v| v.map(|json| Value::Text(json.to_string()))),
        ref other if is_text(other) => row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map(Value::Text)),
        ref other => {
            return Err(format!(
                "column '{}' has unsupported type {other}",
                column.name()
            ))
        }
    };

    decoded
        .map(|value| value.unwrap_or(Value::Null))
        .map_err(|err| format!("failed to decode column '{}': {err}", column.name()))
}
