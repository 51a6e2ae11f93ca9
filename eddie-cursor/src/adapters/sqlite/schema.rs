use rusqlite::Connection;

use crate::types::error::CursorError;

pub fn initialize_schema(conn: &Connection) -> Result<(), CursorError> {
    conn.execute_batch("
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            subject     TEXT,
            sender      TEXT NOT NULL DEFAULT '',
            snippet     TEXT,
            date_ms     INTEGER NOT NULL DEFAULT 0,   -- unix epoch ms
            starred     INTEGER NOT NULL DEFAULT 0,
            read        INTEGER NOT NULL DEFAULT 0,
            folder      TEXT NOT NULL DEFAULT 'inbox', -- 'inbox' | 'archive' | 'spam' | 'drafts'
            muted       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_folder_date ON conversations(folder, date_ms DESC);
    ")?;

    Ok(())
}
