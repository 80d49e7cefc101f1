//! Typed result values for ad-hoc report execution.
//!
//! Result rows are decoded into an explicit sum type per column rather than
//! a dynamic map of driver-specific values, using the driver's value-level
//! type metadata.

use crate::error::BisubError;
use serde::Serialize;
use serde::ser::SerializeMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// One decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// An ordered column-name -> value mapping for one result row. Column order
/// follows the statement's projection and survives serialization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultRow {
    columns: Vec<(String, SqlValue)>,
}

impl ResultRow {
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(col, value)| (col.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for ResultRow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (col, value) in &self.columns {
            map.serialize_entry(col, value)?;
        }
        map.end()
    }
}

/// Decodes a driver row using value-level type info. Blobs that hold valid
/// UTF-8 come back as text, matching the raw-bytes-are-text rule for report
/// output.
pub fn decode_row(row: &SqliteRow) -> Result<ResultRow, BisubError> {
    let mut columns = Vec::with_capacity(row.len());

    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => SqlValue::Integer(row.try_get::<i64, _>(index)?),
                "REAL" => SqlValue::Real(row.try_get::<f64, _>(index)?),
                "BLOB" => {
                    let bytes = row.try_get::<Vec<u8>, _>(index)?;
                    match String::from_utf8(bytes) {
                        Ok(text) => SqlValue::Text(text),
                        Err(err) => SqlValue::Blob(err.into_bytes()),
                    }
                }
                _ => SqlValue::Text(row.try_get::<String, _>(index)?),
            }
        };
        columns.push((column.name().to_string(), value));
    }

    Ok(ResultRow { columns })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: Vec<(&str, SqlValue)>) -> ResultRow {
        ResultRow {
            columns: pairs
                .into_iter()
                .map(|(col, value)| (col.to_string(), value))
                .collect(),
        }
    }

    #[test]
    fn serializes_as_ordered_object() {
        let json = serde_json::to_string(&row(vec![
            ("zeta", SqlValue::Integer(1)),
            ("alpha", SqlValue::Text("x".to_string())),
            ("maybe", SqlValue::Null),
        ]))
        .unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":"x","maybe":null}"#);
    }

    #[test]
    fn lookup_by_column_name() {
        let row = row(vec![
            ("count", SqlValue::Integer(7)),
            ("ratio", SqlValue::Real(0.5)),
        ]);
        assert_eq!(row.get("count"), Some(&SqlValue::Integer(7)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);
    }
}
