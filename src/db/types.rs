//! Query result types
//!
//! Materialized query results: `load`/`query` decode driver rows into
//! `CellValue`s instead of handing back driver handles.

use rust_decimal::Decimal;
use std::time::Duration;
use tokio_postgres::types::Type;

/// Query execution results
#[derive(Debug, Clone)]
pub struct QueryResults {
    /// Column definitions
    pub columns: Vec<ColumnDef>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Query execution time
    pub execution_time: Duration,
    /// Total row count
    pub row_count: usize,
}

/// Column definition in query results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// PostgreSQL type name as reported by the server
    pub type_name: String,
}

/// A single row of query results
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Cell values in column order
    pub values: Vec<CellValue>,
}

/// A cell value (single column value in a row)
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// NULL value
    Null,
    /// Boolean value
    Boolean(bool),
    /// Integer value (int2/int4/int8 widened)
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Arbitrary-precision NUMERIC value
    Numeric(Decimal),
    /// Text/string value
    Text(String),
    /// JSON or JSONB value (parsed)
    Json(serde_json::Value),
    /// Timestamp without time zone
    Timestamp(chrono::NaiveDateTime),
    /// Timestamp with time zone, normalized to UTC
    TimestampTz(chrono::DateTime<chrono::Utc>),
    /// Calendar date
    Date(chrono::NaiveDate),
    /// UUID value
    Uuid(uuid::Uuid),
    /// Binary data
    Bytea(Vec<u8>),
}

impl CellValue {
    /// Check if this is a NULL value
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Decode a driver row into owned cell values.
pub(crate) fn decode_row(row: &tokio_postgres::Row) -> Row {
    let values = (0..row.len()).map(|idx| decode_cell(row, idx)).collect();
    Row { values }
}

fn decode_cell(row: &tokio_postgres::Row, idx: usize) -> CellValue {
    let ty = row.columns()[idx].type_();
    match *ty {
        Type::BOOL => typed(row.try_get::<_, Option<bool>>(idx), CellValue::Boolean, row, idx),
        Type::INT2 => typed(
            row.try_get::<_, Option<i16>>(idx),
            |v| CellValue::Integer(v as i64),
            row,
            idx,
        ),
        Type::INT4 => typed(
            row.try_get::<_, Option<i32>>(idx),
            |v| CellValue::Integer(v as i64),
            row,
            idx,
        ),
        Type::INT8 => typed(row.try_get::<_, Option<i64>>(idx), CellValue::Integer, row, idx),
        Type::FLOAT4 => typed(
            row.try_get::<_, Option<f32>>(idx),
            |v| CellValue::Float(v as f64),
            row,
            idx,
        ),
        Type::FLOAT8 => typed(row.try_get::<_, Option<f64>>(idx), CellValue::Float, row, idx),
        Type::NUMERIC => typed(
            row.try_get::<_, Option<Decimal>>(idx),
            CellValue::Numeric,
            row,
            idx,
        ),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            typed(row.try_get::<_, Option<String>>(idx), CellValue::Text, row, idx)
        }
        Type::JSON | Type::JSONB => typed(
            row.try_get::<_, Option<serde_json::Value>>(idx),
            CellValue::Json,
            row,
            idx,
        ),
        Type::TIMESTAMP => typed(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx),
            CellValue::Timestamp,
            row,
            idx,
        ),
        Type::TIMESTAMPTZ => typed(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx),
            CellValue::TimestampTz,
            row,
            idx,
        ),
        Type::DATE => typed(
            row.try_get::<_, Option<chrono::NaiveDate>>(idx),
            CellValue::Date,
            row,
            idx,
        ),
        Type::UUID => typed(
            row.try_get::<_, Option<uuid::Uuid>>(idx),
            CellValue::Uuid,
            row,
            idx,
        ),
        Type::BYTEA => typed(
            row.try_get::<_, Option<Vec<u8>>>(idx),
            CellValue::Bytea,
            row,
            idx,
        ),
        // Arrays and everything else fall back to text
        _ => try_as_string(row, idx),
    }
}

fn typed<T>(
    value: Result<Option<T>, tokio_postgres::Error>,
    wrap: impl FnOnce(T) -> CellValue,
    row: &tokio_postgres::Row,
    idx: usize,
) -> CellValue {
    match value {
        Ok(Some(v)) => wrap(v),
        Ok(None) => CellValue::Null,
        Err(_) => try_as_string(row, idx),
    }
}

/// Last-resort extraction as text; names the server type when even that fails
fn try_as_string(row: &tokio_postgres::Row, idx: usize) -> CellValue {
    match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(v)) => CellValue::Text(v),
        Ok(None) => CellValue::Null,
        Err(_) => {
            let type_name = row
                .columns()
                .get(idx)
                .map_or("unknown", |c| c.type_().name());
            CellValue::Text(format!("<unsupported: {}>", type_name))
        }
    }
}
