//! Convert record values into typed PostgreSQL binds, driven by the column type.

use crate::error::StorageError;
use crate::schema::ColumnType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

/// A value bound to a PostgreSQL query. Nulls keep their column type so the
/// server never has to guess.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Text(Option<String>),
    Bool(Option<bool>),
    I64(Option<i64>),
    F64(Option<f64>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<Value>),
    TextArray(Vec<String>),
    BoolArray(Vec<bool>),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
    TimestampArray(Vec<DateTime<Utc>>),
}

fn encode_err(column: &str, ty: ColumnType, v: &Value) -> StorageError {
    StorageError::Encode {
        column: column.to_string(),
        message: format!("{} is not a valid {}", v, ty.sql_type()),
    }
}

fn parse_timestamp(column: &str, v: &Value) -> Result<DateTime<Utc>, StorageError> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| encode_err(column, ColumnType::DateTime, v))
}

impl PgBindValue {
    pub fn from_value(column: &str, ty: ColumnType, v: &Value) -> Result<Self, StorageError> {
        if ty == ColumnType::Json {
            return Ok(PgBindValue::Json((!v.is_null()).then(|| v.clone())));
        }
        if v.is_null() {
            return Ok(match ty {
                ColumnType::Text => PgBindValue::Text(None),
                ColumnType::Boolean => PgBindValue::Bool(None),
                ColumnType::Integer => PgBindValue::I64(None),
                ColumnType::Float => PgBindValue::F64(None),
                ColumnType::DateTime => PgBindValue::Timestamp(None),
                ColumnType::Json => PgBindValue::Json(None),
            });
        }
        let err = || encode_err(column, ty, v);
        Ok(match ty {
            ColumnType::Text => PgBindValue::Text(Some(v.as_str().ok_or_else(err)?.to_string())),
            ColumnType::Boolean => PgBindValue::Bool(Some(v.as_bool().ok_or_else(err)?)),
            ColumnType::Integer => PgBindValue::I64(Some(v.as_i64().ok_or_else(err)?)),
            ColumnType::Float => PgBindValue::F64(Some(v.as_f64().ok_or_else(err)?)),
            ColumnType::DateTime => PgBindValue::Timestamp(Some(parse_timestamp(column, v)?)),
            ColumnType::Json => PgBindValue::Json(Some(v.clone())),
        })
    }

    /// Array bind for `= ANY($n)`.
    pub fn array(column: &str, ty: ColumnType, items: &[Value]) -> Result<Self, StorageError> {
        let err = |v: &Value| encode_err(column, ty, v);
        Ok(match ty {
            ColumnType::Text => PgBindValue::TextArray(
                items
                    .iter()
                    .map(|v| v.as_str().map(String::from).ok_or_else(|| err(v)))
                    .collect::<Result<_, _>>()?,
            ),
            ColumnType::Boolean => {
                PgBindValue::BoolArray(items.iter().map(|v| v.as_bool().ok_or_else(|| err(v))).collect::<Result<_, _>>()?)
            }
            ColumnType::Integer => {
                PgBindValue::I64Array(items.iter().map(|v| v.as_i64().ok_or_else(|| err(v))).collect::<Result<_, _>>()?)
            }
            ColumnType::Float => {
                PgBindValue::F64Array(items.iter().map(|v| v.as_f64().ok_or_else(|| err(v))).collect::<Result<_, _>>()?)
            }
            ColumnType::DateTime => PgBindValue::TimestampArray(
                items
                    .iter()
                    .map(|v| parse_timestamp(column, v))
                    .collect::<Result<_, _>>()?,
            ),
            ColumnType::Json => {
                return Err(StorageError::Encode {
                    column: column.to_string(),
                    message: "list membership is not supported on JSON columns".into(),
                })
            }
        })
    }

    pub fn bind<'q>(self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            PgBindValue::Text(v) => query.bind(v),
            PgBindValue::Bool(v) => query.bind(v),
            PgBindValue::I64(v) => query.bind(v),
            PgBindValue::F64(v) => query.bind(v),
            PgBindValue::Timestamp(v) => query.bind(v),
            PgBindValue::Json(v) => query.bind(v),
            PgBindValue::TextArray(v) => query.bind(v),
            PgBindValue::BoolArray(v) => query.bind(v),
            PgBindValue::I64Array(v) => query.bind(v),
            PgBindValue::F64Array(v) => query.bind(v),
            PgBindValue::TimestampArray(v) => query.bind(v),
        }
    }
}
