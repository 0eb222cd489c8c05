//! Pipeline configuration.
//!
//! Built-in defaults are overridden by a TOML file (`--config` or the
//! `CENSUS_MAP_CONFIG` environment variable), which the CLI then overrides
//! with its own flags.
//!
//! ```toml
//! data_dir = "data/census"
//! concurrency = 2000
//!
//! [staging]
//! backend = "duckdb"
//! path = "data/staging.duckdb"
//! ```

use std::path::{Path, PathBuf};

use census_map_source::TextEncoding;
use census_map_staging::StagingBackend;
use serde::{Deserialize, Serialize};

use crate::{StatsError, paths};

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV_VAR: &str = "CENSUS_MAP_CONFIG";

/// Geography level whose rows carry the per-entity values.
pub const DEFAULT_GEO_LEVEL: &str = "Dissemination area";

/// Settings for a statistics run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Directory holding the census extracts.
    pub data_dir: PathBuf,
    /// File name fragment that selects input files in `data_dir`.
    pub file_pattern: String,
    /// Attribute catalog JSON.
    pub catalog_path: PathBuf,
    /// Output path of the ranges artifact.
    pub ranges_path: PathBuf,
    /// Geography level of relevant rows.
    pub geo_level: String,
    /// Maximum number of in-flight row handlers.
    pub concurrency: usize,
    /// Records per Phase FINAL batch lookup.
    pub lookup_batch_size: usize,
    /// Text encoding of the extracts.
    pub encoding: TextEncoding,
    /// Staging backend.
    pub staging: StagingBackend,
    /// When set, staged values are exported here after a run.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::census_dir(),
            file_pattern: "English_CSV_data".to_string(),
            catalog_path: paths::catalog_path(),
            ranges_path: paths::ranges_path(),
            geo_level: DEFAULT_GEO_LEVEL.to_string(),
            concurrency: 1000,
            lookup_batch_size: 1000,
            encoding: TextEncoding::Latin1,
            staging: StagingBackend::Memory,
            snapshot_path: None,
        }
    }
}

impl StatisticsConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Toml`] if the document is invalid, or
    /// [`StatsError::Config`] if a value is out of range.
    pub fn from_toml(text: &str) -> Result<Self, StatsError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the file named by [`CONFIG_ENV_VAR`], or falls back
    /// to the defaults when neither is given.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, StatsError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(&path).map_err(|e| {
            StatsError::Config(format!("cannot read {}: {e}", path.display()))
        })?;

        log::debug!("Loaded configuration from {}", path.display());

        Self::from_toml(&text)
    }

    /// Stages values in a `DuckDB` file at `path`, or at
    /// [`paths::staging_db_path`] when no path is given.
    pub fn use_duckdb(&mut self, path: Option<PathBuf>) {
        self.staging = StagingBackend::Duckdb {
            path: path.unwrap_or_else(paths::staging_db_path),
        };
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Config`] if `concurrency` or
    /// `lookup_batch_size` is zero, or `geo_level` is empty.
    pub fn validate(&self) -> Result<(), StatsError> {
        if self.concurrency == 0 {
            return Err(StatsError::Config("concurrency must be at least 1".to_string()));
        }
        if self.lookup_batch_size == 0 {
            return Err(StatsError::Config(
                "lookup_batch_size must be at least 1".to_string(),
            ));
        }
        if self.geo_level.trim().is_empty() {
            return Err(StatsError::Config("geo_level must not be empty".to_string()));
        }
        Ok(())
    }
}
