//! Local override store
//!
//! Holds pending local edits keyed by row: column overrides, soft-delete
//! markers and mostly-dead markers, each entry stamped with its last write.
//! Entries decay when a newer snapshot makes them redundant.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::snapshot::Snapshot;
use crate::types::error::CursorError;
use crate::types::{is_reserved_column, ColumnValue, RowId, DELETED_COLUMN, MOSTLY_DEAD_COLUMN};

/// Pending local changes for one row
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub values: BTreeMap<String, ColumnValue>,
    pub deleted: bool,
    /// Whether this soft-delete counts toward the store's deleted count
    ///
    /// Only rows present in the active snapshot are counted.
    pub counted: bool,
    pub mostly_dead: bool,
    pub written_at: DateTime<Utc>,
}

impl Override {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            values: BTreeMap::new(),
            deleted: false,
            counted: false,
            mostly_dead: false,
            written_at: now,
        }
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty() && !self.deleted && !self.mostly_dead
    }
}

/// Outcome of pruning the store against an incoming snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Entries removed from the store
    pub removed: usize,
    /// Soft-deletes dropped because the snapshot already excludes the row
    pub confirmed_deletes: usize,
}

#[derive(Debug, Default)]
pub struct LocalOverrideStore {
    entries: HashMap<RowId, Override>,
    deleted_count: usize,
    mostly_dead_count: usize,
}

impl LocalOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &RowId) -> Option<&Override> {
        self.entries.get(id)
    }

    /// Soft-deleted rows counted against the active snapshot
    pub fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    pub fn mostly_dead_count(&self) -> usize {
        self.mostly_dead_count
    }

    pub fn is_deleted(&self, id: &RowId) -> bool {
        self.entries.get(id).map_or(false, |o| o.deleted)
    }

    pub fn is_mostly_dead(&self, id: &RowId) -> bool {
        self.entries.get(id).map_or(false, |o| o.mostly_dead)
    }

    pub fn mostly_dead_rows(&self) -> Vec<RowId> {
        self.entries
            .iter()
            .filter(|(_, o)| o.mostly_dead)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Cached value for a column, including the reserved markers
    pub fn value(&self, id: &RowId, column: &str) -> Option<ColumnValue> {
        let entry = self.entries.get(id)?;
        match column {
            DELETED_COLUMN if entry.deleted => Some(ColumnValue::Bool(true)),
            MOSTLY_DEAD_COLUMN if entry.mostly_dead => Some(ColumnValue::Bool(true)),
            DELETED_COLUMN | MOSTLY_DEAD_COLUMN => None,
            _ => entry.values.get(column).cloned(),
        }
    }

    /// Overwrite columns of a row
    ///
    /// Reserved columns are rejected before anything is written.
    pub fn put_values<I>(&mut self, id: &RowId, values: I, now: DateTime<Utc>) -> Result<(), CursorError>
    where
        I: IntoIterator<Item = (String, ColumnValue)>,
    {
        let values: Vec<(String, ColumnValue)> = values.into_iter().collect();
        if let Some((column, _)) = values.iter().find(|(c, _)| is_reserved_column(c)) {
            return Err(CursorError::InvalidInput(format!(
                "Column '{}' is reserved and cannot be overridden",
                column
            )));
        }
        if values.is_empty() {
            return Ok(());
        }

        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Override::new(now));
        entry.values.extend(values);
        entry.written_at = now;
        Ok(())
    }

    /// Set or clear the soft-delete marker
    ///
    /// `counted` tells whether the row is part of the active snapshot and so
    /// should affect the effective row count. Returns true when the marker
    /// changed.
    pub fn set_deleted(&mut self, id: &RowId, deleted: bool, counted: bool, now: DateTime<Utc>) -> bool {
        if !deleted && !self.entries.contains_key(id) {
            return false;
        }

        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Override::new(now));
        if entry.deleted == deleted {
            return false;
        }

        entry.deleted = deleted;
        entry.written_at = now;
        if deleted {
            entry.counted = counted;
            if counted {
                self.deleted_count += 1;
            }
        } else {
            if entry.counted {
                self.deleted_count -= 1;
            }
            entry.counted = false;
        }

        if entry.is_empty() {
            self.entries.remove(id);
        }
        true
    }

    /// Set or clear the mostly-dead marker; returns true when it changed
    pub fn set_mostly_dead(&mut self, id: &RowId, mostly_dead: bool, now: DateTime<Utc>) -> bool {
        if !mostly_dead && !self.entries.contains_key(id) {
            return false;
        }

        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Override::new(now));
        if entry.mostly_dead == mostly_dead {
            return false;
        }

        entry.mostly_dead = mostly_dead;
        entry.written_at = now;
        if mostly_dead {
            self.mostly_dead_count += 1;
        } else {
            self.mostly_dead_count -= 1;
        }

        if entry.is_empty() {
            self.entries.remove(id);
        }
        true
    }

    /// Drop entries made redundant by an incoming snapshot
    ///
    /// A soft-delete for a row the snapshot no longer contains is removed
    /// (the deletion is reflected upstream). Any other entry is removed once it
    /// is older than `window` and the snapshot was taken after its last write.
    /// Mostly-dead entries are kept. Deleted counts are re-derived against the
    /// incoming snapshot.
    pub fn prune(&mut self, snapshot: &Snapshot, now: DateTime<Utc>, window: Duration) -> PruneStats {
        let mut stats = PruneStats::default();
        let taken_at = snapshot.taken_at();

        self.entries.retain(|id, entry| {
            if entry.mostly_dead {
                return true;
            }

            if entry.deleted && !snapshot.contains(id) {
                debug!("Local delete of {} confirmed by new snapshot", id);
                stats.confirmed_deletes += 1;
                stats.removed += 1;
                return false;
            }

            let expired = now - entry.written_at >= window;
            if expired && taken_at > entry.written_at {
                stats.removed += 1;
                return false;
            }

            true
        });

        self.deleted_count = 0;
        for (id, entry) in self.entries.iter_mut() {
            if entry.deleted {
                entry.counted = snapshot.contains(id);
                if entry.counted {
                    self.deleted_count += 1;
                }
            }
        }

        stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deleted_count = 0;
        self.mostly_dead_count = 0;
    }
}
