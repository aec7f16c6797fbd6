// ABOUTME: Typed scalar values and rows extracted from configuration-driven tables
// ABOUTME: Converts PostgreSQL rows into ChangeRows and binds them back as parameters

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::error::{SyncError, SyncResult};

/// One nullable column value.
///
/// Table shapes are only known at runtime, so values carry their own type tag.
/// Equality is structural and drives the "did anything change" diff in merges.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Integer view used for `lastProcessedId`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            ColumnValue::Numeric(d) if d.fract().is_zero() => i64::try_from(*d).ok(),
            ColumnValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Timestamp view (UTC) used for change detection.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::TimestampTz(ts) => Some(*ts),
            ColumnValue::Timestamp(ts) => Some(ts.and_utc()),
            ColumnValue::Date(d) => d.and_hms_opt(0, 0, 0).map(|ts| ts.and_utc()),
            _ => None,
        }
    }

    /// Decode column `idx` of a PostgreSQL row according to its wire type.
    pub fn from_row(row: &Row, idx: usize) -> SyncResult<Self> {
        let column = &row.columns()[idx];
        let ty = column.type_();
        let decode_err = |e: tokio_postgres::Error| {
            SyncError::Extraction(format!(
                "failed to decode column {} ({}): {}",
                column.name(),
                ty,
                e
            ))
        };

        let value = match *ty {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Bool),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .map_err(decode_err)?
                .map(|v| ColumnValue::Int(v.into())),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .map_err(decode_err)?
                .map(|v| ColumnValue::Int(v.into())),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Int),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map_err(decode_err)?
                .map(|v| ColumnValue::Float(v.into())),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Float),
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Numeric),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
                .try_get::<_, Option<String>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Text),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Timestamp),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::TimestampTz),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Date),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Json),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Bytes),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .map_err(decode_err)?
                .map(ColumnValue::Uuid),
            _ => {
                return Err(SyncError::Extraction(format!(
                    "column {} has unsupported type {}",
                    column.name(),
                    ty
                )))
            }
        };

        Ok(value.unwrap_or(ColumnValue::Null))
    }
}

impl ToSql for ColumnValue {
    /// Binds the value to the destination column's type, widening or
    /// narrowing numeric and timestamp variants where the destination differs
    /// from the source.
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            ColumnValue::Null => Ok(IsNull::Yes),
            ColumnValue::Bool(v) => v.to_sql(ty, out),
            ColumnValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            ColumnValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            ColumnValue::Numeric(d) => match *ty {
                Type::INT2 => i16::try_from(*d)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*d)?.to_sql(ty, out),
                Type::INT8 => i64::try_from(*d)?.to_sql(ty, out),
                Type::FLOAT8 => f64::try_from(*d)?.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => d.to_string().to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            ColumnValue::Text(s) => s.as_str().to_sql(ty, out),
            ColumnValue::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.and_utc().to_sql(ty, out),
                Type::DATE => ts.date().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            ColumnValue::TimestampTz(ts) => match *ty {
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                Type::DATE => ts.date_naive().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            ColumnValue::Date(d) => match *ty {
                Type::TIMESTAMP => d.and_hms_opt(0, 0, 0).to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            ColumnValue::Json(v) => v.to_sql(ty, out),
            ColumnValue::Bytes(v) => v.as_slice().to_sql(ty, out),
            ColumnValue::Uuid(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One extracted source record: column name to value, in source column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeRow {
    values: Vec<(String, ColumnValue)>,
}

impl ChangeRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style push, convenient in tests and in-memory sources.
    pub fn with(mut self, column: &str, value: ColumnValue) -> Self {
        self.push(column, value);
        self
    }

    /// Set a column, replacing an existing value of the same name.
    pub fn push(&mut self, column: &str, value: ColumnValue) {
        match self.values.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((column.to_string(), value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ColumnValue> {
        self.values.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert a PostgreSQL row, skipping the named bookkeeping columns.
    pub fn from_pg_row(row: &Row, skip: &[&str]) -> SyncResult<Self> {
        let mut change = ChangeRow::new();
        for (idx, column) in row.columns().iter().enumerate() {
            if skip.contains(&column.name()) {
                continue;
            }
            change
                .values
                .push((column.name().to_string(), ColumnValue::from_row(row, idx)?));
        }
        Ok(change)
    }
}

/// Rows that share one column set, in one order.
///
/// Merges rely on every row having the same shape, so the invariant is checked
/// once here, where extraction builds the batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    columns: Vec<String>,
    rows: Vec<ChangeRow>,
}

impl ChangeBatch {
    pub fn new(rows: Vec<ChangeRow>) -> SyncResult<Self> {
        let columns: Vec<String> = match rows.first() {
            Some(first) => first.columns().map(str::to_string).collect(),
            None => return Ok(Self::default()),
        };

        for (position, row) in rows.iter().enumerate() {
            let same_shape = row.len() == columns.len()
                && row.columns().zip(columns.iter()).all(|(a, b)| a == b);
            if !same_shape {
                return Err(SyncError::Extraction(format!(
                    "row {} has columns [{}], expected [{}]",
                    position,
                    row.columns().collect::<Vec<_>>().join(", "),
                    columns.join(", ")
                )));
            }
        }

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[ChangeRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}
