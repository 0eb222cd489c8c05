#![allow(clippy::module_name_repetitions)]
//! Default locations of pipeline inputs and outputs.
//!
//! All paths are relative to the process working directory.

use std::path::{Path, PathBuf};

/// Returns the `data/` directory path.
#[must_use]
pub fn data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Returns the `data/census/` directory holding the census extracts.
#[must_use]
pub fn census_dir() -> PathBuf {
    data_dir().join("census")
}

/// Returns the `output/` directory for generated artifacts.
#[must_use]
pub fn output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Returns the path of the attribute catalog.
#[must_use]
pub fn catalog_path() -> PathBuf {
    output_dir().join("menu_list.json")
}

/// Returns the path of the attribute ranges artifact.
#[must_use]
pub fn ranges_path() -> PathBuf {
    output_dir().join("ranges.json")
}

/// Returns the default path for a durable `DuckDB` staging store.
#[must_use]
pub fn staging_db_path() -> PathBuf {
    data_dir().join("staging.duckdb")
}

/// Ensures the parent directory of `path` exists, creating it if
/// necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent)
        }
        _ => Ok(()),
    }
}
