//! Error types for kplot catalog queries.

use thiserror::Error;

/// Result type alias for kplot catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type reported to catalog consumers.
///
/// Line-local ingestion problems never surface here; they are counted per
/// session. Every variant is an explicit failure so the consuming layer can
/// tell "no data yet" apart from "bad request".
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    // Lookup errors (20-29)
    #[error("source not found: {source_id}")]
    SourceNotFound { source_id: String },

    #[error("session not found: {source_id}/{session_id}")]
    SessionNotFound {
        source_id: String,
        session_id: String,
    },

    #[error("source {source_id} has no sessions")]
    NoSessions { source_id: String },

    // Query errors (30-39)
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("query timed out after {millis}ms")]
    QueryTimeout { millis: u64 },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lifecycle errors (70-79)
    #[error("refresh worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::SourceNotFound { .. } => 20,
            Error::SessionNotFound { .. } => 21,
            Error::NoSessions { .. } => 22,
            Error::InvalidRange(_) => 30,
            Error::QueryTimeout { .. } => 31,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Worker(_) => 70,
        }
    }

    /// Whether the error means the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::SourceNotFound { .. } | Error::SessionNotFound { .. } | Error::NoSessions { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_grouped() {
        assert_eq!(Error::Config("x".into()).code(), 10);
        assert_eq!(
            Error::SessionNotFound {
                source_id: "kbot".into(),
                session_id: "s".into()
            }
            .code(),
            21
        );
        assert_eq!(Error::QueryTimeout { millis: 5 }.code(), 31);
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::SourceNotFound {
            source_id: "kbot".into()
        }
        .is_not_found());
        assert!(!Error::InvalidRange("start > end".into()).is_not_found());
    }

    #[test]
    fn test_display_includes_identifiers() {
        let err = Error::SessionNotFound {
            source_id: "kbot-01".into(),
            session_id: "session_20251013_110106".into(),
        };
        assert_eq!(
            err.to_string(),
            "session not found: kbot-01/session_20251013_110106"
        );
    }
}
