use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use tracing::debug;
use url::Url;

use super::DbPool;
use crate::sync::backend::RemoteOperation;
use crate::types::error::CursorError;
use crate::types::{operations, ColumnValue, ColumnValues, Row, RowId, OPERATION_COLUMN};

/// Path segment naming the conversation collection
pub const COLLECTION: &str = "conversation";

/// Columns a mutation may write
pub const WRITABLE_COLUMNS: &[&str] = &[
    "subject", "sender", "snippet", "date_ms", "starred", "read", "folder", "muted",
];

/// Columns of an inbox snapshot, in order
pub const SNAPSHOT_COLUMNS: &[&str] = &[
    "uri", "subject", "sender", "snippet", "date_ms", "starred", "read", "folder",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub subject: Option<String>,
    pub sender: String,
    pub snippet: Option<String>,
    pub date_ms: i64,
    pub starred: bool,
    pub read: bool,
    pub folder: String,
    pub muted: bool,
}

impl Conversation {
    pub fn new(id: &str, sender: &str, date_ms: i64) -> Self {
        Self {
            id: id.to_string(),
            subject: None,
            sender: sender.to_string(),
            snippet: None,
            date_ms,
            starred: false,
            read: false,
            folder: "inbox".to_string(),
            muted: false,
        }
    }

    /// Snapshot row for this conversation under `authority`
    pub fn to_row(&self, authority: &str) -> Row {
        let uri = row_id(authority, &self.id);
        let mut row = Row::new(uri.clone())
            .with("uri", uri.as_str())
            .with("sender", self.sender.as_str())
            .with("date_ms", self.date_ms)
            .with("starred", self.starred)
            .with("read", self.read)
            .with("folder", self.folder.as_str());
        if let Some(subject) = &self.subject {
            row = row.with("subject", subject.as_str());
        }
        if let Some(snippet) = &self.snippet {
            row = row.with("snippet", snippet.as_str());
        }
        row
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            subject: row.get(1)?,
            sender: row.get(2)?,
            snippet: row.get(3)?,
            date_ms: row.get(4)?,
            starred: row.get::<_, i32>(5)? != 0,
            read: row.get::<_, i32>(6)? != 0,
            folder: row.get(7)?,
            muted: row.get::<_, i32>(8)? != 0,
        })
    }
}

const SELECT_COLUMNS: &str = "id, subject, sender, snippet, date_ms, starred, read, folder, muted";

pub fn row_id(authority: &str, id: &str) -> RowId {
    RowId::new(format!("content://{}/{}/{}", authority, COLLECTION, id))
}

/// Conversation id addressed by a row identifier
pub fn conversation_id(row: &RowId) -> Result<String, CursorError> {
    let url = Url::parse(row.as_str())?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [collection, id] if *collection == COLLECTION => Ok(id.to_string()),
        _ => Err(CursorError::InvalidUri(format!("Not a conversation: {}", row))),
    }
}

fn is_collection(row: &RowId) -> bool {
    Url::parse(row.as_str())
        .map(|url| url.path().trim_matches('/') == COLLECTION)
        .unwrap_or(false)
}

fn sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Bool(b) => Value::Integer(i64::from(*b)),
        ColumnValue::Int(i) => Value::Integer(i64::from(*i)),
        ColumnValue::Long(l) => Value::Integer(*l),
        ColumnValue::Text(s) => Value::Text(s.clone()),
        ColumnValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn check_column(column: &str) -> Result<(), CursorError> {
    if WRITABLE_COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(CursorError::InvalidInput(format!("Unknown conversation column: {}", column)))
    }
}

pub fn upsert(pool: &DbPool, conversation: &Conversation) -> Result<(), CursorError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO conversations
            (id, subject, sender, snippet, date_ms, starred, read, folder, muted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            conversation.id,
            conversation.subject,
            conversation.sender,
            conversation.snippet,
            conversation.date_ms,
            conversation.starred as i32,
            conversation.read as i32,
            conversation.folder,
            conversation.muted as i32,
        ],
    )?;
    Ok(())
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<Conversation>, CursorError> {
    let conn = pool.get()?;
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", SELECT_COLUMNS);
    let conversation = conn
        .query_row(&sql, params![id], Conversation::from_row)
        .optional()?;
    Ok(conversation)
}

/// Inbox view: newest first, muted and non-inbox conversations excluded
pub fn list_inbox(pool: &DbPool) -> Result<Vec<Conversation>, CursorError> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM conversations
         WHERE folder = 'inbox' AND muted = 0
         ORDER BY date_ms DESC, id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], Conversation::from_row)?;

    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(row?);
    }
    Ok(conversations)
}

fn get_in(tx: &Transaction, id: &str) -> Result<Option<Conversation>, CursorError> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", SELECT_COLUMNS);
    Ok(tx.query_row(&sql, params![id], Conversation::from_row).optional()?)
}

fn apply_operation(tx: &Transaction, id: &str, operation: &str) -> Result<usize, CursorError> {
    let changed = match operation {
        operations::ARCHIVE => tx.execute(
            "UPDATE conversations SET folder = 'archive' WHERE id = ?1",
            params![id],
        )?,
        operations::MUTE => tx.execute("UPDATE conversations SET muted = 1 WHERE id = ?1", params![id])?,
        operations::REPORT_SPAM | operations::REPORT_PHISHING => tx.execute(
            "UPDATE conversations SET folder = 'spam' WHERE id = ?1",
            params![id],
        )?,
        operations::REPORT_NOT_SPAM => tx.execute(
            "UPDATE conversations SET folder = 'inbox' WHERE id = ?1",
            params![id],
        )?,
        operations::DISCARD_DRAFTS => tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?,
        other => {
            return Err(CursorError::InvalidInput(format!("Unknown operation: {}", other)));
        }
    };
    Ok(changed)
}

fn update_columns(tx: &Transaction, id: &str, values: &ColumnValues) -> Result<usize, CursorError> {
    let columns: Vec<&String> = values.keys().filter(|c| c.as_str() != OPERATION_COLUMN).collect();
    if columns.is_empty() {
        return Ok(0);
    }
    for column in &columns {
        check_column(column)?;
    }

    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ?{}", column, i + 2))
        .collect();
    let sql = format!("UPDATE conversations SET {} WHERE id = ?1", assignments.join(", "));

    let mut bound = vec![Value::Text(id.to_string())];
    bound.extend(columns.iter().filter_map(|c| values.get(c.as_str())).map(sql_value));
    Ok(tx.execute(&sql, params_from_iter(bound))?)
}

fn insert(tx: &Transaction, collection: &RowId, values: &ColumnValues) -> Result<(), CursorError> {
    if !is_collection(collection) {
        return Err(CursorError::InvalidUri(format!("Not the conversation collection: {}", collection)));
    }
    let id = values
        .get("id")
        .and_then(ColumnValue::as_str)
        .ok_or_else(|| CursorError::InvalidInput("Inserted conversation needs a text id".into()))?;

    let columns: Vec<&String> = values.keys().filter(|c| c.as_str() != "id").collect();
    for column in &columns {
        check_column(column)?;
    }

    let names: Vec<&str> = std::iter::once("id").chain(columns.iter().map(|c| c.as_str())).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO conversations ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );

    let mut bound = vec![Value::Text(id.to_string())];
    bound.extend(columns.iter().filter_map(|c| values.get(c.as_str())).map(sql_value));
    tx.execute(&sql, params_from_iter(bound))?;
    Ok(())
}

/// Apply a batch in one transaction
///
/// Returns the prior state of every conversation a destructive operation
/// touched, for undo.
pub fn apply_batch(pool: &DbPool, batch: &[RemoteOperation]) -> Result<Vec<Conversation>, CursorError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let mut previous = Vec::new();

    for operation in batch {
        match operation {
            RemoteOperation::Insert { collection, values } => insert(&tx, collection, values)?,
            RemoteOperation::Update { id: row, values } => {
                let id = conversation_id(row)?;
                let before = get_in(&tx, &id)?
                    .ok_or_else(|| CursorError::RowNotFound(row.to_string()))?;

                if let Some(op) = values.get(OPERATION_COLUMN) {
                    let op = op
                        .as_str()
                        .ok_or_else(|| CursorError::InvalidInput("Operation must be text".into()))?;
                    apply_operation(&tx, &id, op)?;
                    previous.push(before);
                }
                update_columns(&tx, &id, values)?;
            }
            RemoteOperation::Delete { id: row } => {
                let id = conversation_id(row)?;
                if let Some(before) = get_in(&tx, &id)? {
                    tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
                    previous.push(before);
                } else {
                    debug!("Delete of missing conversation {}", id);
                }
            }
        }
    }

    tx.commit()?;
    Ok(previous)
}

/// Put conversations back exactly as they were
pub fn restore(pool: &DbPool, conversations: &[Conversation]) -> Result<usize, CursorError> {
    for conversation in conversations {
        upsert(pool, conversation)?;
    }
    Ok(conversations.len())
}
