//! Data structures shared by the cursor, the sequencer and backends

pub mod error;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use error::CursorError;

/// Reserved column marking a row as soft-deleted
pub const DELETED_COLUMN: &str = "deleted";

/// Reserved column marking a row as provisionally removed (still rendered)
pub const MOSTLY_DEAD_COLUMN: &str = "mostly_dead";

/// Reserved column carrying a named operation (archive, mute, ...) to a backend
pub const OPERATION_COLUMN: &str = "operation";

/// Operation names carried in [`OPERATION_COLUMN`]
pub mod operations {
    pub const ARCHIVE: &str = "archive";
    pub const MUTE: &str = "mute";
    pub const REPORT_SPAM: &str = "report_spam";
    pub const REPORT_NOT_SPAM: &str = "report_not_spam";
    pub const REPORT_PHISHING: &str = "report_phishing";
    pub const DISCARD_DRAFTS: &str = "discard_drafts";
}

/// Opaque identifier of one logical row (a `content://authority/path` URI)
///
/// Stable across snapshots even when the row's position changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ColumnValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Long(l) => Some(*l != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(*b as i64),
            Self::Int(i) => Some(*i as i64),
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Boundary for loosely typed values coming from a UI layer
///
/// Integers that fit in i32 become `Int`, larger ones `Long`. Byte arrays
/// are arrays of integers 0-255. Anything else is rejected.
impl TryFrom<serde_json::Value> for ColumnValue {
    type Error = CursorError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(i32::try_from(i).map(Self::Int).unwrap_or(Self::Long(i))),
                None => Err(CursorError::InvalidInput(format!(
                    "Unsupported numeric value: {}",
                    n
                ))),
            },
            Value::String(s) => Ok(Self::Text(s)),
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| {
                            CursorError::InvalidInput(format!("Not a byte value: {}", item))
                        })
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Self::Bytes),
            other => Err(CursorError::InvalidInput(format!(
                "Unsupported column value type: {}",
                other
            ))),
        }
    }
}

/// Column name to value mapping
pub type ColumnValues = BTreeMap<String, ColumnValue>;

/// One fetched row: its identifier plus raw column data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub values: ColumnValues,
}

impl Row {
    pub fn new(id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style column setter
    pub fn with(mut self, column: &str, value: impl Into<ColumnValue>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column)
    }
}

/// Whether a column name is reserved for cursor bookkeeping
pub fn is_reserved_column(column: &str) -> bool {
    column == DELETED_COLUMN || column == MOSTLY_DEAD_COLUMN || column == OPERATION_COLUMN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_value_from_json() {
        assert_eq!(ColumnValue::try_from(json!(true)).unwrap(), ColumnValue::Bool(true));
        assert_eq!(ColumnValue::try_from(json!(42)).unwrap(), ColumnValue::Int(42));
        assert_eq!(
            ColumnValue::try_from(json!(5_000_000_000i64)).unwrap(),
            ColumnValue::Long(5_000_000_000)
        );
        assert_eq!(
            ColumnValue::try_from(json!("hi")).unwrap(),
            ColumnValue::Text("hi".to_string())
        );
        assert_eq!(
            ColumnValue::try_from(json!([1, 2, 255])).unwrap(),
            ColumnValue::Bytes(vec![1, 2, 255])
        );
    }

    #[test]
    fn test_column_value_rejects_unsupported() {
        for value in [json!(null), json!(1.5), json!({"a": 1}), json!([256])] {
            let result = ColumnValue::try_from(value);
            assert!(matches!(result, Err(CursorError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_row_builder() {
        let row = Row::new("content://mail/conversation/1")
            .with("subject", "Hello")
            .with("starred", false);

        assert_eq!(row.get("subject"), Some(&ColumnValue::Text("Hello".to_string())));
        assert_eq!(row.get("starred").and_then(|v| v.as_bool()), Some(false));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_reserved_columns() {
        assert!(is_reserved_column(DELETED_COLUMN));
        assert!(is_reserved_column(MOSTLY_DEAD_COLUMN));
        assert!(is_reserved_column(OPERATION_COLUMN));
        assert!(!is_reserved_column("starred"));
    }
}
