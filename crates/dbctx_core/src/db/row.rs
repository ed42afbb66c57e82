//! Owned result rows and the minimal projection hooks over them.
//!
//! # Invariants
//! - A row owns its values; it stays valid after the connection is closed.
//! - Scalar projections read the first column, matching single-column selects.

use super::{DbError, DbResult};
use rusqlite::types::Value;
use std::sync::Arc;

/// One result row with shared column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads a column by case-insensitive name.
    pub fn get<T: FromValue>(&self, column: &str) -> DbResult<T> {
        let index = self
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
            .ok_or_else(|| DbError::Mapping(format!("no column named `{column}`")))?;
        self.get_index(index)
    }

    pub fn get_index<T: FromValue>(&self, index: usize) -> DbResult<T> {
        let value = self.values.get(index).ok_or_else(|| {
            DbError::Mapping(format!(
                "column index {index} out of range for {} columns",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }
}

/// Conversion from one column value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> DbResult<Self>;
}

/// Conversion from a whole row; implement this for caller-side records.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> DbResult<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> DbResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Integer(number) => Ok(*number),
            other => Err(type_mismatch("integer", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> DbResult<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| DbError::Mapping(format!("{wide} does not fit in i32")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Real(number) => Ok(*number),
            Value::Integer(number) => Ok(*number as f64),
            other => Err(type_mismatch("real", other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> DbResult<Self> {
        match i64::from_value(value)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DbError::Mapping(format!("{other} is not a boolean"))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Text(text) => Ok(text.clone()),
            other => Err(type_mismatch("text", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Blob(bytes) => Ok(bytes.clone()),
            other => Err(type_mismatch("blob", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromRow for Row {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok(row.clone())
    }
}

macro_rules! scalar_from_row {
    ($($ty:ty),*) => {
        $(
            impl FromRow for $ty {
                fn from_row(row: &Row) -> DbResult<Self> {
                    row.get_index(0)
                }
            }
        )*
    };
}

scalar_from_row!(Value, i64, i32, f64, bool, String, Vec<u8>);

impl<T: FromValue> FromRow for Option<T> {
    fn from_row(row: &Row) -> DbResult<Self> {
        row.get_index(0)
    }
}

impl<A: FromValue, B: FromValue> FromRow for (A, B) {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok((row.get_index(0)?, row.get_index(1)?))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue> FromRow for (A, B, C) {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok((row.get_index(0)?, row.get_index(1)?, row.get_index(2)?))
    }
}

fn type_mismatch(expected: &str, found: &Value) -> DbError {
    let found = match found {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    };
    DbError::Mapping(format!("expected {expected}, found {found}"))
}
