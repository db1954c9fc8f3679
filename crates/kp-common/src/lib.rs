//! kplot common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the kplot crates:
//! - Source and session identity types
//! - Query-layer error taxonomy with stable codes
//! - Schema versioning for JSON responses

pub mod error;
pub mod id;
pub mod schema;

pub use error::{Error, Result};
pub use id::{SessionId, SessionKey, SourceId};
pub use schema::SCHEMA_VERSION;
