//! kplot configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust struct for the catalog configuration (`config.json`)
//! - Config resolution (CLI → env → config file → defaults)
//! - Semantic validation

pub mod catalog;
pub mod resolve;
pub mod validate;

pub use catalog::CatalogConfig;
pub use resolve::{resolve_config, resolve_config_with_env, ConfigOverrides, ConfigPaths};
pub use validate::{ValidationError, ValidationResult};
