//! Config resolution: CLI → env → config file → defaults.

use std::path::PathBuf;

use crate::catalog::CatalogConfig;
use crate::validate::{validate, ValidationError, ValidationResult};

pub const ENV_DATA_DIR: &str = "KPLOT_DATA_DIR";
pub const ENV_RECENCY_WINDOW_SECS: &str = "KPLOT_RECENCY_WINDOW_SECS";
pub const ENV_REFRESH_INTERVAL_MS: &str = "KPLOT_REFRESH_INTERVAL_MS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "KPLOT_QUERY_TIMEOUT_MS";

const CONFIG_DIR_NAME: &str = "kplot";
const CONFIG_FILE_NAME: &str = "config.json";

/// Where the config file comes from.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit `--config` path; must exist when set.
    pub explicit: Option<PathBuf>,
    /// Discovered `$XDG_CONFIG_HOME/kplot/config.json`; used only if present.
    pub discovered: Option<PathBuf>,
}

impl ConfigPaths {
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
            discovered: None,
        }
    }

    /// Standard location lookup, with an optional explicit path taking priority.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            discovered: dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)),
        }
    }

    fn file_to_load(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return Some(path.clone());
        }
        self.discovered.as_ref().filter(|p| p.is_file()).cloned()
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub recency_window_secs: Option<u64>,
    pub refresh_interval_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
}

/// Resolve the effective config using the process environment.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    paths: &ConfigPaths,
) -> ValidationResult<CatalogConfig> {
    resolve_config_with_env(overrides, paths, |key| std::env::var(key).ok())
}

/// Resolve the effective config with an injectable environment lookup.
pub fn resolve_config_with_env<F>(
    overrides: &ConfigOverrides,
    paths: &ConfigPaths,
    env: F,
) -> ValidationResult<CatalogConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match paths.file_to_load() {
        Some(path) => CatalogConfig::from_file(&path)?,
        None => CatalogConfig::default(),
    };

    if let Some(dir) = env(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(v) = env_u64(&env, ENV_RECENCY_WINDOW_SECS)? {
        config.recency_window_secs = v;
    }
    if let Some(v) = env_u64(&env, ENV_REFRESH_INTERVAL_MS)? {
        config.refresh_interval_ms = v;
    }
    if let Some(v) = env_u64(&env, ENV_QUERY_TIMEOUT_MS)? {
        config.query_timeout_ms = v;
    }

    if let Some(dir) = &overrides.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(v) = overrides.recency_window_secs {
        config.recency_window_secs = v;
    }
    if let Some(v) = overrides.refresh_interval_ms {
        config.refresh_interval_ms = v;
    }
    if let Some(v) = overrides.query_timeout_ms {
        config.query_timeout_ms = v;
    }

    config.data_dir = expand_home(&config.data_dir);
    validate(&config)?;
    Ok(config)
}

fn env_u64<F>(env: &F, key: &'static str) -> ValidationResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ValidationError::InvalidValue {
                field: key,
                reason: format!("'{}': {}", raw, e),
            }),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
