//! Catalog configuration types.
//!
//! Matches the on-disk `config.json` layout; every field is optional in the
//! file and falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kp_telemetry::DEFAULT_POLL_CHUNK_BYTES;

use crate::validate::ValidationError;

/// Log file expected inside every session directory.
pub const DEFAULT_LOG_FILE_NAME: &str = "kinfer_log.ndjson";

/// Default data root relative to the user's home directory.
pub const DEFAULT_DATA_DIR_NAME: &str = "robot_telemetry";

pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 30;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1500;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2000;

/// Complete catalog configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Root directory laid out as `<data_dir>/<source>/<session>/<log>`.
    pub data_dir: PathBuf,

    /// A session is "live" when its log was modified within this window.
    pub recency_window_secs: u64,

    /// Pause between background refresh passes.
    pub refresh_interval_ms: u64,

    /// Upper bound on a single series query.
    pub query_timeout_ms: u64,

    /// Read budget per log file per refresh pass.
    pub poll_chunk_bytes: usize,

    /// Maximum records retained per session; `None` keeps everything.
    pub store_capacity: Option<usize>,

    /// Name of the log file inside each session directory.
    pub log_file_name: String,
}

impl CatalogConfig {
    /// Config rooted at `data_dir` with defaults for everything else.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window_secs = window.as_secs();
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = Some(capacity);
        self
    }

    pub fn with_poll_chunk_bytes(mut self, bytes: usize) -> Self {
        self.poll_chunk_bytes = bytes;
        self
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_json(&content)
    }

    /// Parse a config from a JSON string.
    pub fn parse_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::ParseError(format!("Invalid JSON: {}", e)))
    }
}

/// `~/robot_telemetry`, or a relative `robot_telemetry` when no home exists.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR_NAME))
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            poll_chunk_bytes: DEFAULT_POLL_CHUNK_BYTES,
            store_capacity: None,
            log_file_name: DEFAULT_LOG_FILE_NAME.to_string(),
        }
    }
}
