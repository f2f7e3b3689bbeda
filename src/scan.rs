//! Decoding rows into Rust values.
//!
//! A [`Row`] holds decoded [`PgValue`]s inline (up to 16 columns without a
//! heap allocation) next to the shared column descriptions of its result.
//! Columns are addressed by position or by name; [`FromValue`] converts a
//! single value and [`FromRow`] a whole row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::pg::statement::SharedColumns;
use crate::pg::types::{self, PgValue};

pub type RowValues = SmallVec<[PgValue; 16]>;

/// One decoded result row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: RowValues,
}

impl Row {
    pub fn new(columns: SharedColumns, values: RowValues) -> Self {
        Self { columns, values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> RowValues {
        self.values
    }

    /// Raw value of a column.
    pub fn value<I: ColumnIndex>(&self, index: I) -> Result<&PgValue> {
        let i = index.position(self)?;
        Ok(&self.values[i])
    }

    /// Typed value of a column.
    pub fn get<T: FromValue, I: ColumnIndex>(&self, index: I) -> Result<T> {
        let i = index.position(self)?;
        convert(&self.values[i], || self.column_label(i))
    }

    fn column_label(&self, i: usize) -> String {
        self.columns
            .get(i)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("#{}", i))
    }

    /// The row as a JSON object keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (self.column_label(i), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Build any deserializable struct by matching column names to fields.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json()).map_err(|e| Error::Scan(e.to_string()))
    }
}

fn convert<T: FromValue>(value: &PgValue, column: impl FnOnce() -> String) -> Result<T> {
    T::from_value(value).ok_or_else(|| Error::TypeMismatch {
        column: column(),
        expected: T::type_name(),
        found: describe(value),
    })
}

fn describe(value: &PgValue) -> String {
    match value {
        PgValue::Null => "NULL".to_string(),
        other => other.type_oid().name(),
    }
}

// ============================================================================
// Column addressing
// ============================================================================

/// A way of picking a column out of a row.
pub trait ColumnIndex {
    fn position(&self, row: &Row) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, row: &Row) -> Result<usize> {
        if *self < row.len() {
            Ok(*self)
        } else {
            Err(Error::Scan(format!(
                "column index {} out of range for row of {} column(s)",
                self,
                row.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn position(&self, row: &Row) -> Result<usize> {
        row.columns
            .iter()
            .position(|c| c.name == *self)
            .filter(|i| *i < row.len())
            .ok_or_else(|| Error::Scan(format!("no column named {:?}", self)))
    }
}

impl ColumnIndex for String {
    fn position(&self, row: &Row) -> Result<usize> {
        self.as_str().position(row)
    }
}

// ============================================================================
// Single values
// ============================================================================

/// Conversion from one column value. `None` means the value cannot be
/// represented as `Self`.
pub trait FromValue: Sized {
    fn from_value(value: &PgValue) -> Option<Self>;

    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl FromValue for PgValue {
    fn from_value(value: &PgValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Null => Some(None),
            v => T::from_value(v).map(Some),
        }
    }

    fn type_name() -> &'static str {
        T::type_name()
    }
}

impl FromValue for bool {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for i16 {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Int2(v) => Some(*v),
            PgValue::Int4(v) => i16::try_from(*v).ok(),
            PgValue::Int8(v) => i16::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Int2(v) => Some(*v as i32),
            PgValue::Int4(v) => Some(*v),
            PgValue::Int8(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Int2(v) => Some(*v as i64),
            PgValue::Int4(v) => Some(*v as i64),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Float4(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Float4(v) => Some(*v as f64),
            PgValue::Float8(v) => Some(*v),
            PgValue::Int2(v) => Some(*v as f64),
            PgValue::Int4(v) => Some(*v as f64),
            PgValue::Numeric(v) => v.parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Text(v) | PgValue::Json(v) | PgValue::Numeric(v) => Some(v.clone()),
            PgValue::Raw { data, .. } => String::from_utf8(data.clone()).ok(),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Bytea(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Json(v) => serde_json::from_str(v).ok(),
            _ => None,
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Uuid(v) => Some(uuid::Uuid::from_bytes(*v)),
            PgValue::Text(v) => uuid::Uuid::parse_str(v).ok(),
            _ => None,
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Date(v) => types::days_to_date(*v),
            _ => None,
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Time(v) => Some(types::micros_to_time(*v)),
            _ => None,
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => types::micros_to_timestamp(*v),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &PgValue) -> Option<Self> {
        match value {
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => {
                types::micros_to_timestamp(*v).map(|ts| ts.and_utc())
            }
            _ => None,
        }
    }
}

// ============================================================================
// Whole rows
// ============================================================================

/// Conversion from a whole row.
///
/// Implemented for single-column scalars, tuples (by position) and [`Row`].
/// For structs, implement it by hand with [`Row::get`] or go through
/// [`Row::deserialize`].
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

fn expect_columns(row: &Row, n: usize) -> Result<()> {
    if row.len() == n {
        Ok(())
    } else {
        Err(Error::Scan(format!(
            "expected {} column(s), row has {}",
            n,
            row.len()
        )))
    }
}

macro_rules! impl_from_row_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromRow for $t {
                fn from_row(row: &Row) -> Result<Self> {
                    expect_columns(row, 1)?;
                    row.get(0)
                }
            }

            impl FromRow for Option<$t> {
                fn from_row(row: &Row) -> Result<Self> {
                    expect_columns(row, 1)?;
                    row.get(0)
                }
            }
        )*
    };
}

impl_from_row_scalar!(
    bool,
    i16,
    i32,
    i64,
    f32,
    f64,
    String,
    Vec<u8>,
    serde_json::Value,
    uuid::Uuid,
    NaiveDate,
    NaiveTime,
    NaiveDateTime,
    DateTime<Utc>,
);

macro_rules! impl_from_row_tuple {
    ($n:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                expect_columns(row, $n)?;
                Ok(($(row.get::<$name, usize>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1; A: 0);
impl_from_row_tuple!(2; A: 0, B: 1);
impl_from_row_tuple!(3; A: 0, B: 1, C: 2);
impl_from_row_tuple!(4; A: 0, B: 1, C: 2, D: 3);
impl_from_row_tuple!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_from_row_tuple!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_from_row_tuple!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_from_row_tuple!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Convert every row.
pub fn rows_as<T: FromRow>(rows: &[Row]) -> Result<Vec<T>> {
    rows.iter().map(T::from_row).collect()
}

/// The only row, or `NoRows` / `TooManyRows`.
pub fn exactly_one<T: FromRow>(rows: &[Row]) -> Result<T> {
    match rows {
        [] => Err(Error::NoRows),
        [row] => T::from_row(row),
        _ => Err(Error::TooManyRows),
    }
}

/// The only row if there is one; more than one is `TooManyRows`.
pub fn at_most_one<T: FromRow>(rows: &[Row]) -> Result<Option<T>> {
    match rows {
        [] => Ok(None),
        [row] => T::from_row(row).map(Some),
        _ => Err(Error::TooManyRows),
    }
}
