//! Error types for telemetry ingestion and queries.

use std::path::PathBuf;
use thiserror::Error;

/// Why a single NDJSON line was rejected.
///
/// Both variants are line-local: ingestion skips the line and counts it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line is not valid JSON
    #[error("malformed JSON: {message}")]
    MalformedJson { message: String },

    /// Line is JSON but not a valid telemetry record
    #[error("schema violation in '{field}': {reason}")]
    SchemaViolation { field: &'static str, reason: String },
}

impl ParseError {
    pub(crate) fn schema(field: &'static str, reason: impl Into<String>) -> Self {
        ParseError::SchemaViolation {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from polling a log file.
#[derive(Error, Debug)]
pub enum ReadError {
    /// File shrank below the read offset or was replaced; the reader has
    /// already reset to offset 0 and the owner must rebuild its store.
    #[error(
        "log truncated or rotated: {path} (offset {previous_offset}, size {current_size})"
    )]
    Truncated {
        path: PathBuf,
        previous_offset: u64,
        current_size: u64,
    },

    /// File could not be stat'ed, opened, or read.
    #[error("log unavailable: {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a series query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("query exceeded its {limit_ms}ms budget")]
    Timeout { limit_ms: u64 },
}

impl From<QueryError> for kp_common::Error {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidRange(msg) => kp_common::Error::InvalidRange(msg),
            QueryError::Timeout { limit_ms } => kp_common::Error::QueryTimeout { millis: limit_ms },
        }
    }
}
