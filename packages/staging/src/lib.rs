#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Key-value staging store for per-(entity, attribute) census values.
//!
//! Phase RAW writes raw counts here, Phase FINAL overwrites them in place,
//! and the range calculator reads them back grouped by attribute. The store
//! is passed explicitly to every component; [`open`] creates the configured
//! backend and [`StagingStore::close`] releases it.
//!
//! Values are `f64`. A stored `NaN` is "absent" and reads back as `None`.
//! Backends that persist values as text use [`encode_value`] and
//! [`decode_value`], so a literal `"NaN"` also reads back as `None`.

#[cfg(feature = "duckdb")]
pub mod duckdb_store;
pub mod memory;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use census_map_statistics_models::{AttributeId, StagedKey};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;

/// Errors that can occur during staging store operations.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot CSV error.
    #[error("Snapshot CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// `DuckDB` error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// A connection lock was poisoned by a panicking writer.
    #[error("Staging store lock poisoned")]
    Poisoned,

    /// The configured backend was not compiled in.
    #[error("Staging backend {backend:?} is not available in this build")]
    BackendUnavailable {
        /// Requested backend name.
        backend: String,
    },
}

/// Intermediate store for staged values.
///
/// Implementations must tolerate concurrent calls from many in-flight row
/// handlers. Writes to the same key are last-write-wins.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the write fails.
    async fn put(&self, key: StagedKey, value: f64) -> Result<(), StagingError>;

    /// Writes several values. Entries are applied in order.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if any write fails.
    async fn put_many(&self, entries: Vec<(StagedKey, f64)>) -> Result<(), StagingError> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Reads the value under `key`. Missing keys and stored `NaN` are `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the read fails.
    async fn get(&self, key: &StagedKey) -> Result<Option<f64>, StagingError>;

    /// Reads several keys in one round-trip. Every requested key is present
    /// in the result.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the read fails.
    async fn get_many(
        &self,
        keys: &[StagedKey],
    ) -> Result<BTreeMap<StagedKey, Option<f64>>, StagingError> {
        let mut values = BTreeMap::new();
        for key in keys {
            values.insert(key.clone(), self.get(key).await?);
        }
        Ok(values)
    }

    /// All `(entity, value)` pairs staged for `attribute_id`, in
    /// unspecified order.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the read fails.
    async fn entries_for_attribute(
        &self,
        attribute_id: AttributeId,
    ) -> Result<Vec<(String, Option<f64>)>, StagingError>;

    /// All values staged for `attribute_id`, in unspecified order.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the read fails.
    async fn values_for_attribute(
        &self,
        attribute_id: AttributeId,
    ) -> Result<Vec<Option<f64>>, StagingError> {
        Ok(self
            .entries_for_attribute(attribute_id)
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Number of staged keys.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the count fails.
    async fn len(&self) -> Result<u64, StagingError>;

    /// Flushes and releases the store. Called once at the end of a run,
    /// whether it succeeded or not.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if flushing fails.
    async fn close(&self) -> Result<(), StagingError> {
        Ok(())
    }
}

/// Which staging backend a run uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StagingBackend {
    /// Process memory. Nothing survives the run unless a snapshot is written.
    #[default]
    Memory,
    /// A `DuckDB` file (requires the `duckdb` feature).
    Duckdb {
        /// Database file path.
        path: PathBuf,
    },
}

/// Opens the configured backend.
///
/// # Errors
///
/// Returns [`StagingError::BackendUnavailable`] if the backend was not
/// compiled in, or the backend's own error if opening fails.
#[allow(clippy::unused_async)]
pub async fn open(
    backend: &StagingBackend,
) -> Result<std::sync::Arc<dyn StagingStore>, StagingError> {
    match backend {
        StagingBackend::Memory => {
            log::info!("Staging values in memory");
            Ok(std::sync::Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "duckdb")]
        StagingBackend::Duckdb { path } => {
            log::info!("Staging values in DuckDB at {}", path.display());
            Ok(std::sync::Arc::new(duckdb_store::DuckDbStore::open(path)?))
        }
        #[cfg(not(feature = "duckdb"))]
        StagingBackend::Duckdb { .. } => Err(StagingError::BackendUnavailable {
            backend: "duckdb".to_string(),
        }),
    }
}

/// Text form of a staged value. Absent and `NaN` values become `"NaN"`.
#[must_use]
pub fn encode_value(value: Option<f64>) -> String {
    match value {
        Some(v) if !v.is_nan() => v.to_string(),
        _ => "NaN".to_string(),
    }
}

/// Parses a staged value. `"NaN"`, empty, and unparsable text are `None`.
#[must_use]
pub fn decode_value(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_text_decodes_to_absent() {
        assert_eq!(decode_value("NaN"), None);
        assert_eq!(decode_value(""), None);
        assert_eq!(decode_value("twelve"), None);
        assert_eq!(decode_value(" 12.5 "), Some(12.5));
    }

    #[test]
    fn encodes_absent_as_nan() {
        assert_eq!(encode_value(None), "NaN");
        assert_eq!(encode_value(Some(f64::NAN)), "NaN");
        assert_eq!(encode_value(Some(25.0)), "25");
        assert_eq!(encode_value(Some(0.1)), "0.1");
    }

    #[test]
    fn encoded_values_decode_bit_for_bit() {
        for value in [0.1, 1.0 / 3.0, 1e-300, 123_456_789.125] {
            let decoded = decode_value(&encode_value(Some(value))).unwrap();
            assert_eq!(decoded.to_bits(), value.to_bits());
        }
    }

    #[cfg(not(feature = "duckdb"))]
    #[tokio::test]
    async fn duckdb_backend_reports_when_unavailable() {
        let backend = StagingBackend::Duckdb {
            path: PathBuf::from("staging.duckdb"),
        };
        assert!(matches!(
            open(&backend).await,
            Err(StagingError::BackendUnavailable { .. })
        ));
    }
}
