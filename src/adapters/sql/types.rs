//! Decoding SQL rows into records.
//!
//! Column types are first sorted into a [`TypeCategory`]; each backend then
//! decodes the column with the Rust type that category implies.

use super::macros::DatabaseType;
use crate::models::Record;
use serde_json::{Number, Value};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::{Column, Decode, Row, Type, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    /// Dates, times and timestamps, rendered as ISO 8601 text.
    Temporal,
}

/// Classify a backend type name.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Before the float check: "numeric" would match both.
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.contains("timestamp")
        || lower.contains("datetime")
        || matches!(lower.as_str(), "date" | "time" | "timetz")
    {
        return TypeCategory::Temporal;
    }
    TypeCategory::Text
}

/// DECIMAL/NUMERIC as the exact text the server sent.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary as UTF-8 text when asked for and valid, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> Value {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) if decode_binary => Value::String(s.to_string()),
        _ => Value::String(STANDARD.encode(bytes)),
    }
}

fn text_value<T: ToString>(v: Option<T>) -> Value {
    v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null)
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

pub trait RowToRecord {
    fn to_record(&self, decode_binary: bool) -> Result<Record, sqlx::Error>;
}

impl RowToRecord for MySqlRow {
    fn to_record(&self, decode_binary: bool) -> Result<Record, sqlx::Error> {
        Ok(self
            .columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySql);
                let value = mysql::decode_column(self, col.ordinal(), category, decode_binary);
                (col.name().to_string(), value)
            })
            .collect())
    }
}

impl RowToRecord for PgRow {
    fn to_record(&self, decode_binary: bool) -> Result<Record, sqlx::Error> {
        Ok(self
            .columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::Postgres);
                let value = postgres::decode_column(self, col.ordinal(), category, decode_binary);
                (col.name().to_string(), value)
            })
            .collect())
    }
}

impl RowToRecord for SqliteRow {
    fn to_record(&self, decode_binary: bool) -> Result<Record, sqlx::Error> {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let value = match sqlite::category(self, idx, col.type_info().name())? {
                    Some(category) => sqlite::decode_column(self, idx, category, decode_binary)?,
                    None => Value::Null,
                };
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        category: TypeCategory,
        decode_binary: bool,
    ) -> Value {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => v.map(|d| Value::String(d.0)).unwrap_or(Value::Null),
                Err(e) => {
                    tracing::error!("Failed to decode DECIMAL: {:?}", e);
                    Value::Null
                }
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            TypeCategory::Float => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return float_value(v);
                }
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| float_value(v as f64))
                    .unwrap_or(Value::Null)
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| decode_binary_value(&v, decode_binary))
                .unwrap_or(Value::Null),
            TypeCategory::Json => row
                .try_get::<Option<Value>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Text | TypeCategory::Uuid => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }

    fn decode_temporal(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return text_value(v);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return text_value(v);
        }
        if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return text_value(v);
        }
        text_value(row.try_get::<Option<String>, _>(idx).ok().flatten())
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return Value::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return Value::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return Value::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return Value::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Value::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return Value::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return Value::Number(v.into());
        }
        Value::Null
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        category: TypeCategory,
        decode_binary: bool,
    ) -> Value {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => v.map(|d| Value::String(d.0)).unwrap_or(Value::Null),
                Err(e) => {
                    tracing::error!("Failed to decode NUMERIC: {:?}", e);
                    Value::Null
                }
            },
            TypeCategory::Integer => {
                if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
                    return Value::Number(v.into());
                }
                if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                    return Value::Number(v.into());
                }
                row.try_get::<Option<i64>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| Value::Number(v.into()))
                    .unwrap_or(Value::Null)
            }
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            TypeCategory::Float => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return float_value(v);
                }
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| float_value(v as f64))
                    .unwrap_or(Value::Null)
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| decode_binary_value(&v, decode_binary))
                .unwrap_or(Value::Null),
            TypeCategory::Json => row
                .try_get::<Option<Value>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            TypeCategory::Uuid => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string()))
                .unwrap_or(Value::Null),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }

    fn decode_temporal(row: &PgRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return text_value(v);
        }
        if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return text_value(v);
        }
        if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return text_value(v);
        }
        text_value(row.try_get::<Option<String>, _>(idx).ok().flatten())
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;

    /// Pick the category for a SQLite value.
    ///
    /// SQLite is dynamically typed and expression columns (`count(*)`,
    /// literals, arithmetic) carry no declared type, so the value's storage
    /// class decides. The declared type only refines INTEGER into a boolean.
    /// `None` means the value is SQL NULL.
    pub fn category(
        row: &SqliteRow,
        idx: usize,
        declared: &str,
    ) -> Result<Option<TypeCategory>, sqlx::Error> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(None);
        }
        let declared = categorize_type(declared, DatabaseType::SQLite);
        let category = match raw.type_info().name() {
            "INTEGER" if declared == TypeCategory::Boolean => TypeCategory::Boolean,
            "INTEGER" => TypeCategory::Integer,
            "REAL" => TypeCategory::Float,
            "BLOB" => TypeCategory::Binary,
            "TEXT" => TypeCategory::Text,
            _ => declared,
        };
        Ok(Some(category))
    }

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        category: TypeCategory,
        decode_binary: bool,
    ) -> Result<Value, sqlx::Error> {
        let value = match category {
            TypeCategory::Integer => row
                .try_get::<Option<i64>, _>(idx)?
                .map(|v| Value::Number(v.into())),
            TypeCategory::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
            TypeCategory::Float | TypeCategory::Decimal => {
                row.try_get::<Option<f64>, _>(idx)?.map(float_value)
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)?
                .map(|v| decode_binary_value(&v, decode_binary)),
            TypeCategory::Text
            | TypeCategory::Json
            | TypeCategory::Uuid
            | TypeCategory::Temporal => row.try_get::<Option<String>, _>(idx)?.map(Value::String),
        };
        Ok(value.unwrap_or(Value::Null))
    }
}
