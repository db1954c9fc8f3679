//! kplot core: session catalog over a directory of robot telemetry logs.
//!
//! - [`index`]: discovery, ingestion, and per-pass snapshots
//! - [`catalog`]: query façade answering from the published snapshot
//! - [`refresh`]: background worker that keeps the catalog current
//! - [`logging`]: global `tracing` subscriber setup
//! - [`exit_codes`]: stable process exit codes for the CLI

pub mod catalog;
pub mod exit_codes;
pub mod index;
pub mod logging;
pub mod refresh;

pub use catalog::{
    CatalogService, LatestInfo, NamedSeriesResponse, OverlayResponse, OverlayRun, SeriesResponse,
    SessionMatch, SessionSummary,
};
pub use exit_codes::ExitCode;
pub use index::{
    CatalogSnapshot, RefreshReport, SessionIndex, SessionSnapshot, SessionStatus,
};
pub use refresh::RefreshHandle;
