#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Two-pass census statistics pipeline.
//!
//! Reads the census profile extracts, stages every relevant
//! `(entity, attribute) -> count` value (Phase RAW), rewrites counts that
//! have a divisor as percentages of the divisor's count (Phase FINAL), and
//! derives a trimmed `{min, max}` range per attribute for map styling.
//!
//! The staging store is an explicit handle. [`pipeline::run_with_store`]
//! opens it at the start of a run and closes it on every exit path.

pub mod aggregate;
pub mod config;
pub mod filter;
pub mod paths;
pub mod pipeline;
pub mod range;
pub mod stream;
pub mod verify;

use std::path::PathBuf;

use census_map_catalog::CatalogError;
use census_map_source::SourceError;
use census_map_staging::StagingError;
use census_map_statistics_models::Phase;

pub use config::StatisticsConfig;
pub use pipeline::{PipelineProgress, run, run_with_store};

/// Errors that abort a statistics run.
///
/// Malformed rows are not errors: they are skipped with a warning and
/// counted in [`census_map_statistics_models::PassSummary`]. Missing
/// divisor values are counted there as well.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// An input file is missing, unreadable, or lacks a required column.
    /// Raised before any phase starts.
    #[error("Cannot use input file {}: {source}", path.display())]
    FileAccess {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        source: SourceError,
    },

    /// A staging store read or write failed during a pass.
    #[error("Staging store failed during phase {phase} on {file}: {source}")]
    Store {
        /// Pass that was running.
        phase: Phase,
        /// File being processed.
        file: String,
        /// Underlying error.
        source: StagingError,
    },

    /// A census file could not be read during a pass.
    #[error("Reading {file} failed during phase {phase}: {source}")]
    Read {
        /// Pass that was running.
        phase: Phase,
        /// File being processed.
        file: String,
        /// Underlying error.
        source: SourceError,
    },

    /// Census file error outside a pass.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Staging store error outside a pass.
    #[error("Staging store error: {0}")]
    Staging(#[from] StagingError),

    /// Catalog error.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("Configuration TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background reader or handler task failed to join.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
