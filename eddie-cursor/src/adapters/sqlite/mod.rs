//! Reference authority backed by SQLite
//!
//! Serves the inbox view as snapshots and applies forwarded mutations, both
//! on tokio's blocking pool so the async side never waits on the database.

pub mod conversations;
pub mod pool;
pub mod schema;

pub use pool::DbPool;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cursor::snapshot::Snapshot;
use crate::sync::backend::{MutationBackend, RemoteOperation, SnapshotSource};
use crate::types::error::CursorError;
use crate::types::RowId;
use conversations::Conversation;

async fn blocking<T, F>(task: F) -> Result<T, CursorError>
where
    F: FnOnce() -> Result<T, CursorError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CursorError::Runtime(format!("Database task failed: {}", e)))?
}

pub struct SqliteAuthority {
    pool: DbPool,
    authority: String,
    /// Prior state of the conversations touched by the most recent
    /// destructive batch
    undo_log: Arc<Mutex<HashMap<String, Conversation>>>,
}

impl SqliteAuthority {
    pub fn new(pool: DbPool, authority: impl Into<String>) -> Result<Self, CursorError> {
        schema::initialize_schema(&*pool.get()?)?;
        Ok(Self {
            pool,
            authority: authority.into(),
            undo_log: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn open(path: &Path, authority: impl Into<String>) -> Result<Self, CursorError> {
        info!("Opening conversation store at {:?}", path);
        Self::new(pool::create_pool(path)?, authority)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory(authority: impl Into<String>) -> Result<Self, CursorError> {
        Self::new(pool::create_memory_pool()?, authority)
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn row_id(&self, id: &str) -> RowId {
        conversations::row_id(&self.authority, id)
    }

    pub fn upsert(&self, conversation: &Conversation) -> Result<(), CursorError> {
        conversations::upsert(&self.pool, conversation)
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>, CursorError> {
        conversations::get(&self.pool, id)
    }

    /// Read the inbox view synchronously
    pub fn load_snapshot(&self) -> Result<Snapshot, CursorError> {
        load_inbox(&self.pool, &self.authority)
    }
}

fn load_inbox(pool: &DbPool, authority: &str) -> Result<Snapshot, CursorError> {
    let rows = conversations::list_inbox(pool)?
        .iter()
        .map(|c| c.to_row(authority))
        .collect();
    let columns = conversations::SNAPSHOT_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .collect();
    Ok(Snapshot::new(columns, rows))
}

#[async_trait]
impl SnapshotSource for SqliteAuthority {
    async fn fetch(&self) -> Result<Option<Snapshot>, CursorError> {
        let pool = self.pool.clone();
        let authority = self.authority.clone();
        let snapshot = blocking(move || load_inbox(&pool, &authority)).await?;
        debug!("Loaded inbox snapshot: {} rows", snapshot.len());
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl MutationBackend for SqliteAuthority {
    async fn apply(&self, authority: &str, operations: Vec<RemoteOperation>) -> Result<(), CursorError> {
        if authority != self.authority {
            return Err(CursorError::Backend(format!("Unknown authority: {}", authority)));
        }

        let pool = self.pool.clone();
        let count = operations.len();
        let previous = blocking(move || conversations::apply_batch(&pool, &operations)).await?;

        if !previous.is_empty() {
            let mut batch = HashMap::new();
            for conversation in previous {
                batch.entry(conversation.id.clone()).or_insert(conversation);
            }
            *self.undo_log.lock().unwrap_or_else(|e| e.into_inner()) = batch;
        }
        info!("Applied {} operations to {}", count, authority);
        Ok(())
    }

    async fn undo(&self, authority: &str, rows: Vec<RowId>) -> Result<(), CursorError> {
        if authority != self.authority {
            return Err(CursorError::Backend(format!("Unknown authority: {}", authority)));
        }

        let restorable: Vec<Conversation> = {
            let mut log = self.undo_log.lock().unwrap_or_else(|e| e.into_inner());
            let mut restorable = Vec::new();
            for row in &rows {
                let id = conversations::conversation_id(row)?;
                if let Some(conversation) = log.remove(&id) {
                    restorable.push(conversation);
                }
            }
            restorable
        };

        let pool = self.pool.clone();
        let restored = blocking(move || conversations::restore(&pool, &restorable)).await?;
        info!("Restored {} of {} conversations on {}", restored, rows.len(), authority);
        Ok(())
    }
}
