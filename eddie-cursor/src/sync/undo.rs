//! Undo tracking for the most recent destructive batch

use std::collections::BTreeSet;
use tracing::debug;

use crate::types::RowId;

/// Rows affected by the last destructive batch, tagged with its sequence
///
/// Only one batch is ever undoable: recording a row under a newer sequence
/// discards the previous set.
#[derive(Debug, Default)]
pub struct UndoTracker {
    sequence: u64,
    rows: BTreeSet<RowId>,
}

impl UndoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row removed by the batch stamped `sequence`
    pub fn record(&mut self, sequence: u64, id: RowId) {
        if self.sequence != sequence {
            self.sequence = sequence;
            self.rows.clear();
        }
        self.rows.insert(id);
    }

    /// Sequence of the tracked batch, 0 when nothing is tracked
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn rows(&self) -> impl Iterator<Item = &RowId> {
        self.rows.iter()
    }

    /// Whether an undo issued at `current_sequence` would do anything
    pub fn can_undo(&self, current_sequence: u64) -> bool {
        self.sequence != 0 && self.sequence == current_sequence && !self.rows.is_empty()
    }

    /// Take the tracked rows if the batch is still the latest one
    ///
    /// The tracker is emptied either way once a take succeeds.
    pub fn take(&mut self, current_sequence: u64) -> Option<Vec<RowId>> {
        if !self.can_undo(current_sequence) {
            debug!(
                "Undo window closed: tracked sequence {}, current {}",
                self.sequence, current_sequence
            );
            return None;
        }

        self.sequence = 0;
        Some(std::mem::take(&mut self.rows).into_iter().collect())
    }

    pub fn clear(&mut self) {
        self.sequence = 0;
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_batch_only() {
        let mut tracker = UndoTracker::new();
        tracker.record(1, RowId::from("content://mail/c/1"));
        tracker.record(1, RowId::from("content://mail/c/2"));
        assert_eq!(tracker.rows().count(), 2);

        tracker.record(2, RowId::from("content://mail/c/3"));
        assert_eq!(tracker.sequence(), 2);
        assert_eq!(tracker.rows().count(), 1);

        assert!(tracker.take(1).is_none());
        assert_eq!(tracker.take(2), Some(vec![RowId::from("content://mail/c/3")]));
    }

    #[test]
    fn test_superseded_batch_is_not_undoable() {
        let mut tracker = UndoTracker::new();
        tracker.record(4, RowId::from("content://mail/c/1"));

        // A newer, non-destructive batch advanced the sequence
        assert!(!tracker.can_undo(5));
        assert!(tracker.take(5).is_none());
    }

    #[test]
    fn test_take_empties_tracker() {
        let mut tracker = UndoTracker::new();
        tracker.record(1, RowId::from("content://mail/c/1"));

        assert!(tracker.take(1).is_some());
        assert!(tracker.take(1).is_none());
        assert!(!tracker.can_undo(1));
    }
}
