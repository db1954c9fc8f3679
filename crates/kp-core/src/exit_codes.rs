//! Exit codes for the kplot CLI.
//!
//! Scripts can branch on the outcome without parsing output. The values are
//! stable.

use kp_common::Error;

/// Exit codes for kplot commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Command succeeded
    Clean = 0,

    /// Configuration could not be loaded or is invalid
    ConfigError = 10,

    /// Filesystem or serialization failure
    IoError = 13,

    /// Source or session does not exist
    NotFound = 20,

    /// Malformed query range
    InvalidRange = 21,

    /// Query exceeded its time budget
    QueryTimeout = 22,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Config(_) => ExitCode::ConfigError,
            Error::SourceNotFound { .. }
            | Error::SessionNotFound { .. }
            | Error::NoSessions { .. } => ExitCode::NotFound,
            Error::InvalidRange(_) => ExitCode::InvalidRange,
            Error::QueryTimeout { .. } => ExitCode::QueryTimeout,
            Error::Io(_) | Error::Json(_) => ExitCode::IoError,
            Error::Worker(_) => ExitCode::InternalError,
        }
    }
}
