//! Semantic validation for catalog configuration.

use thiserror::Error;

use crate::catalog::CatalogConfig;

/// Configuration loading/validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Check a resolved config for values the catalog cannot run with.
pub fn validate(config: &CatalogConfig) -> ValidationResult<()> {
    if config.data_dir.as_os_str().is_empty() {
        return Err(invalid("data_dir", "must not be empty"));
    }
    if config.refresh_interval_ms == 0 {
        return Err(invalid("refresh_interval_ms", "must be positive"));
    }
    if config.poll_chunk_bytes == 0 {
        return Err(invalid("poll_chunk_bytes", "must be positive"));
    }
    if config.store_capacity == Some(0) {
        return Err(invalid("store_capacity", "must be positive when set"));
    }
    if config.log_file_name.is_empty() {
        return Err(invalid("log_file_name", "must not be empty"));
    }
    if config.log_file_name.contains('/') || config.log_file_name.contains('\\') {
        return Err(invalid(
            "log_file_name",
            format!("'{}' must be a bare file name", config.log_file_name),
        ));
    }
    Ok(())
}
