#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Census CSV extract access.
//!
//! Statistics Canada publishes the census profile as a handful of very
//! large CSV files (tens of millions of rows each). This crate finds those
//! files, decodes their rows, and exposes them either as a blocking iterator
//! ([`reader::RowReader`]) or as an async stream fed by a blocking reader
//! task ([`reader::stream_rows`]).

pub mod files;
pub mod progress;
pub mod reader;
pub mod row;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Geography level column (e.g. `"Country"`, `"Dissemination area"`).
pub const GEO_LEVEL_COLUMN: &str = "GEO_LEVEL";

/// Geographic unit code column.
pub const DGUID_COLUMN: &str = "DGUID";

/// Characteristic id column.
pub const CHARACTERISTIC_ID_COLUMN: &str = "CHARACTERISTIC_ID";

/// Characteristic display name column. Indentation encodes hierarchy.
pub const CHARACTERISTIC_NAME_COLUMN: &str = "CHARACTERISTIC_NAME";

/// Total count column.
pub const COUNT_TOTAL_COLUMN: &str = "C1_COUNT_TOTAL";

/// Columns every statistics input file must carry.
pub const REQUIRED_COLUMNS: &[&str] = &[
    GEO_LEVEL_COLUMN,
    DGUID_COLUMN,
    CHARACTERISTIC_ID_COLUMN,
    COUNT_TOTAL_COLUMN,
];

/// Errors that can occur while locating or reading census files.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A file could not be opened.
    #[error("Failed to open {}: {source}", path.display())]
    Open {
        /// File that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// CSV decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A required column is missing from the header row.
    #[error("{} is missing required column {column}", path.display())]
    MissingColumn {
        /// File whose header was checked.
        path: PathBuf,
        /// Name of the missing column.
        column: String,
    },

    /// No file in the input directory matched the naming convention.
    #[error("No files matching {pattern:?} in {}", dir.display())]
    NoInputFiles {
        /// Directory that was searched.
        dir: PathBuf,
        /// File name fragment that was required.
        pattern: String,
    },
}

/// Text encoding of a census extract.
///
/// The English extracts are Latin-1. Latin-1 decoding is lossless (each
/// byte is one code point), UTF-8 decoding replaces invalid sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// UTF-8.
    Utf8,
    /// ISO-8859-1.
    #[default]
    Latin1,
}

impl TextEncoding {
    /// Decodes one raw field.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().copied().map(char::from).collect(),
        }
    }
}
