//! Source and session identity types.
//!
//! A recording is uniquely identified by its (source, session) pair, both of
//! which are directory names under the data root:
//! `<data_dir>/<source>/<session>/kinfer_log.ndjson`.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

/// Matches the `YYYYMMDD_HHMMSS` stamp embedded in generated session names.
static SESSION_STAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{8})_(\d{6})").expect("valid session stamp regex"));

/// Robot identifier (top-level directory name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        SourceId(id.to_string())
    }
}

/// Recording session name (second-level directory name).
///
/// Format: `session_<date>_<time>`
/// Example: `session_20251013_110106`
///
/// Names are generated with a zero-padded date-time, so lexical order of
/// well-formed names equals chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Start time encoded in the session name, if it carries one.
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        let caps = SESSION_STAMP.captures(&self.0)?;
        let stamp = format!("{}{}", &caps[1], &caps[2]);
        NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S").ok()
    }

    /// Chronological ordering of two session names.
    ///
    /// Names with an embedded start time compare by that time and sort after
    /// names without one; names without a time compare lexically. Returns
    /// `Equal` only when both carry the same start time or are identical.
    pub fn chronological_cmp(&self, other: &SessionId) -> Ordering {
        match (self.started_at(), other.started_at()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

/// Complete (source, session) key of one recording.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub source: SourceId,
    pub session: SessionId,
}

impl SessionKey {
    pub fn new(source: impl Into<String>, session: impl Into<String>) -> Self {
        SessionKey {
            source: SourceId(source.into()),
            session: SessionId(session.into()),
        }
    }

    /// Human-readable label, e.g. `kbot-01 | session_20251013_110106`.
    pub fn label(&self) -> String {
        format!("{} | {}", self.source, self.session)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.session)
    }
}
