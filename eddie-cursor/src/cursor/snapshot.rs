//! Immutable fetched result sets

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::types::{ColumnValue, Row, RowId};

/// One result set taken atomically from a backing store
///
/// Rows keep their fetched order. A membership index makes containment
/// tests and position lookups O(1).
#[derive(Debug)]
pub struct Snapshot {
    columns: Vec<String>,
    rows: Vec<Row>,
    index: HashMap<RowId, usize>,
    taken_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl Snapshot {
    /// Build a snapshot taken now
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self::new_at(columns, rows, Utc::now())
    }

    /// Build a snapshot with an explicit capture time
    pub fn new_at(columns: Vec<String>, rows: Vec<Row>, taken_at: DateTime<Utc>) -> Self {
        let index = rows
            .iter()
            .enumerate()
            .map(|(pos, row)| (row.id.clone(), pos))
            .collect();

        Self {
            columns,
            rows,
            index,
            taken_at,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a snapshot whose column list is the union of the rows' columns
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.values.keys() {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        Self::new(columns, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.index.contains_key(id)
    }

    pub fn position_of(&self, id: &RowId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn row(&self, pos: usize) -> Option<&Row> {
        self.rows.get(pos)
    }

    pub fn row_id(&self, pos: usize) -> Option<&RowId> {
        self.rows.get(pos).map(|row| &row.id)
    }

    /// Raw column data of the row at `pos`
    pub fn value(&self, pos: usize, column: &str) -> Option<&ColumnValue> {
        self.rows.get(pos).and_then(|row| row.get(column))
    }

    /// Raw column data of a row by identifier
    pub fn value_of(&self, id: &RowId, column: &str) -> Option<&ColumnValue> {
        self.position_of(id).and_then(|pos| self.value(pos, column))
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Release the snapshot; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed snapshot of {} rows taken at {}", self.rows.len(), self.taken_at);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        ["a", "b", "c"]
            .iter()
            .map(|name| {
                Row::new(format!("content://mail/conversation/{}", name)).with("subject", *name)
            })
            .collect()
    }

    #[test]
    fn test_membership_and_lookup() {
        let snapshot = Snapshot::from_rows(rows());
        let b = RowId::from("content://mail/conversation/b");

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.contains(&b));
        assert_eq!(snapshot.position_of(&b), Some(1));
        assert_eq!(snapshot.row_id(2).map(|id| id.as_str()), Some("content://mail/conversation/c"));
        assert_eq!(snapshot.value(0, "subject"), Some(&ColumnValue::Text("a".into())));
        assert_eq!(snapshot.value_of(&b, "subject"), Some(&ColumnValue::Text("b".into())));
        assert!(snapshot.value(3, "subject").is_none());
        assert!(!snapshot.contains(&RowId::from("content://mail/conversation/z")));
        assert_eq!(snapshot.columns(), &["subject".to_string()]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let snapshot = Snapshot::from_rows(rows());
        assert!(!snapshot.is_closed());
        snapshot.close();
        snapshot.close();
        assert!(snapshot.is_closed());
    }
}
