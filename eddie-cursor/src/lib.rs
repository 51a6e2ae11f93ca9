//! Eddie Chat - Caching conversation cursor
//!
//! A read/write view over a remote tabular source: fetched snapshots plus a
//! local override layer, so that edits show up immediately while the backing
//! authorities catch up in the background.
//!
//! ## Module Organization
//!
//! - `cursor/`: The cursor itself, snapshots, local overrides, listeners
//! - `sync/`: Background refresh, mutation sequencing, undo
//! - `config/`: Configuration management
//! - `types/`: Row identifiers, column values, errors
//! - `adapters/`: Reference SQLite authority

pub mod adapters;
pub mod config;
pub mod cursor;
pub mod sync;
pub mod types;

pub use config::CursorConfig;
pub use cursor::listener::{ChannelListener, CursorEvent, CursorListener};
pub use cursor::snapshot::Snapshot;
pub use cursor::CachingCursor;
pub use sync::backend::{MutationBackend, RemoteOperation, SnapshotSource};
pub use sync::refresh::RefreshState;
pub use sync::sequencer::{MutationKind, RowMutation};
pub use types::error::{CursorError, Result};
pub use types::{ColumnValue, ColumnValues, Row, RowId};

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber
///
/// Reads `RUST_LOG`; in debug builds defaults to debug logs for this crate and
/// info for everything else. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("eddie_cursor=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
