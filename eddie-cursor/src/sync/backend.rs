//! Injected collaborators
//!
//! The cursor never reaches for a global provider: the snapshot source and
//! the mutation backend are handed in at construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::snapshot::Snapshot;
use crate::types::error::CursorError;
use crate::types::{ColumnValues, RowId};

/// Produces fresh snapshots of the remote data
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch a new result set
    ///
    /// `Ok(None)` means no snapshot is available right now.
    async fn fetch(&self) -> Result<Option<Snapshot>, CursorError>;
}

/// A mutation forwarded to a backing authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteOperation {
    /// Insert a new row into a collection
    Insert { collection: RowId, values: ColumnValues },
    /// Update columns of a row (may carry an operation column)
    Update { id: RowId, values: ColumnValues },
    /// Delete a row
    Delete { id: RowId },
}

impl RemoteOperation {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// The backing identifier this operation targets
    pub fn target(&self) -> &RowId {
        match self {
            Self::Insert { collection, .. } => collection,
            Self::Update { id, .. } => id,
            Self::Delete { id } => id,
        }
    }
}

/// Applies forwarded mutations to the backing authorities
#[async_trait]
pub trait MutationBackend: Send + Sync {
    /// Apply one batch of operations, all targeting `authority`
    async fn apply(&self, authority: &str, operations: Vec<RemoteOperation>) -> Result<(), CursorError>;

    /// Reverse the most recent destructive batch for these rows
    async fn undo(&self, authority: &str, rows: Vec<RowId>) -> Result<(), CursorError> {
        let _ = (authority, rows);
        Ok(())
    }
}
