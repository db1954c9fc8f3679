//! kplot telemetry ingestion.
//!
//! This crate provides:
//! - NDJSON record parsing and validation (`record`)
//! - Incremental, truncation-aware reading of append-only logs (`reader`)
//! - Chunked columnar storage with segment tracking (`store`)
//! - Range queries with deterministic stride decimation (`query`)
//! - Flattening of records into named numeric series (`series`)

pub mod error;
pub mod query;
pub mod reader;
pub mod record;
pub mod series;
pub mod store;

pub use error::{ParseError, QueryError, ReadError};
pub use query::{Deadline, IndexedRecord, QueryRange, SeriesSlice};
pub use reader::{Cursor, LogReader};
pub use record::{parse, parse_bytes, TelemetryRecord};
pub use series::{collect_named_series, extract_series, SeriesPoints};
pub use store::{AppendOutcome, SegmentInfo, SeriesStore};

/// Default number of records per immutable storage chunk.
pub const DEFAULT_CHUNK_RECORDS: usize = 4096;

/// Default upper bound on points returned by one query.
pub const DEFAULT_MAX_POINTS: usize = 2000;

/// Maximum bytes read from one log file per poll (8 MiB).
pub const DEFAULT_POLL_CHUNK_BYTES: usize = 8 * 1024 * 1024;
