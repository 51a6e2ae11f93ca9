//! Unified error types for the cursor
//!
//! This module defines error types that:
//! - Are serializable so a UI layer can surface them
//! - Keep "the cursor is unusable" distinct from "the cursor is empty"
//! - Map backend and storage errors to a small set of variants

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for cursor reads, mutations and backends
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum CursorError {
    /// The cursor was closed, or never had a snapshot installed
    #[error("Cursor is disabled: no active snapshot")]
    DisabledCursor,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid row identifier: {0}")]
    InvalidUri(String),

    #[error("Row not found: {0}")]
    RowNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<std::io::Error> for CursorError {
    fn from(err: std::io::Error) -> Self {
        CursorError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for CursorError {
    fn from(err: toml::de::Error) -> Self {
        CursorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CursorError {
    fn from(err: serde_json::Error) -> Self {
        CursorError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for CursorError {
    fn from(err: url::ParseError) -> Self {
        CursorError::InvalidUri(err.to_string())
    }
}

impl From<rusqlite::Error> for CursorError {
    fn from(err: rusqlite::Error) -> Self {
        CursorError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for CursorError {
    fn from(err: r2d2::Error) -> Self {
        CursorError::Database(err.to_string())
    }
}

/// Result type alias using CursorError
pub type Result<T> = std::result::Result<T, CursorError>;
