use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::error::CursorError;

/// Cursor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorConfig {
    /// How long a local override survives snapshot swaps (milliseconds)
    ///
    /// Protects very recent edits from being dropped by a refresh that raced
    /// with the edit.
    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: u64,

    /// Authority marker substituted into forwarded row identifiers
    #[serde(default = "default_local_authority")]
    pub local_authority: String,

    /// Name of the canonical identifier column
    #[serde(default = "default_uri_column")]
    pub uri_column: String,

    /// Log a warning when overrides are written off the owner thread
    #[serde(default = "default_true")]
    pub warn_off_owner_thread: bool,
}

fn default_retention_window_ms() -> u64 {
    10_000
}

fn default_local_authority() -> String {
    "eddie.cursor.provider".to_string()
}

fn default_uri_column() -> String {
    "uri".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            retention_window_ms: default_retention_window_ms(),
            local_authority: default_local_authority(),
            uri_column: default_uri_column(),
            warn_off_owner_thread: true,
        }
    }
}

impl CursorConfig {
    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, CursorError> {
        let config: CursorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, CursorError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded cursor config from {:?}", path);
        Ok(config)
    }

    /// Load the configuration at the default path, falling back to defaults
    /// when no file exists
    pub fn load_or_default() -> Result<Self, CursorError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("eddie.chat").join("cursor.toml"))
    }

    pub fn validate(&self) -> Result<(), CursorError> {
        if self.local_authority.is_empty() {
            return Err(CursorError::Config("local_authority must not be empty".into()));
        }
        if self.local_authority.contains('/') {
            return Err(CursorError::Config(format!(
                "local_authority must not contain '/': {}",
                self.local_authority
            )));
        }
        if self.uri_column.is_empty() {
            return Err(CursorError::Config("uri_column must not be empty".into()));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> Duration {
        Duration::milliseconds(self.retention_window_ms.min(i64::MAX as u64) as i64)
    }
}
