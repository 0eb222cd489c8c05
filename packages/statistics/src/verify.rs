//! Staging store integrity check.
//!
//! Re-reads the input files and confirms that every relevant record has a
//! value in the staging store.

use std::path::PathBuf;

use census_map_source::files::display_name;
use census_map_source::reader::stream_rows;
use census_map_source::{REQUIRED_COLUMNS, TextEncoding};
use census_map_staging::StagingStore;
use census_map_statistics_models::StagedKey;
use futures::{TryStreamExt as _, future};

use crate::StatsError;
use crate::filter::RowFilter;

/// Outcome of [`verify_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Relevant records checked.
    pub checked: u64,
    /// Keys of relevant records with no staged value.
    pub missing: Vec<StagedKey>,
}

impl VerifyReport {
    /// Whether every checked key had a value.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks every relevant record of `files` against `store`, looking keys up
/// `batch_size` at a time.
///
/// # Errors
///
/// Returns [`StatsError`] if a file or the store cannot be read.
pub async fn verify_files(
    files: &[PathBuf],
    filter: &RowFilter,
    store: &dyn StagingStore,
    encoding: TextEncoding,
    batch_size: usize,
) -> Result<VerifyReport, StatsError> {
    let mut report = VerifyReport::default();

    for path in files {
        let file = display_name(path);
        log::info!("Verifying staged values for {file}");

        let (rows, reader) = stream_rows(path, encoding, REQUIRED_COLUMNS)?;
        let mut batches = Box::pin(
            rows.try_filter_map(|row| future::ready(Ok(filter.classify(&row).into_record())))
                .map_ok(|record| record.key())
                .try_chunks(batch_size.max(1)),
        );

        while let Some(keys) = batches.try_next().await.map_err(|e| e.1)? {
            report.checked += keys.len() as u64;

            for (key, value) in store.get_many(&keys).await? {
                if value.is_none() {
                    log::debug!("{file}: no staged value for {key}");
                    report.missing.push(key);
                }
            }
        }

        reader.await?;
    }

    log::info!(
        "Checked {} staged keys, {} missing",
        report.checked,
        report.missing.len()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use census_map_catalog::Catalog;
    use census_map_staging::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn reports_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(
            &path,
            "GEO_LEVEL,DGUID,CHARACTERISTIC_ID,C1_COUNT_TOTAL\n\
             Dissemination area,DA1,1,5\n\
             Dissemination area,DA2,1,6\n\
             Country,C1,1,11\n\
             Dissemination area,DA3,1,7\n",
        )
        .unwrap();

        let catalog = Catalog::from_json(r#"{ "A": [ { "id": 1, "name": "a" } ] }"#).unwrap();
        let filter = RowFilter::new("Dissemination area", Arc::new(catalog));

        let store = MemoryStore::new();
        store.put(StagedKey::new("DA1", 1), 5.0).await.unwrap();
        store.put(StagedKey::new("DA3", 1), 7.0).await.unwrap();

        let report = verify_files(&[path], &filter, &store, TextEncoding::Utf8, 2)
            .await
            .unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.missing, [StagedKey::new("DA2", 1)]);
        assert!(!report.is_complete());
    }
}
