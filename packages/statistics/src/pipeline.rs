//! Run orchestration.
//!
//! A run validates its inputs, executes Phase RAW over every file, then
//! Phase FINAL over every file, computes attribute ranges from the staged
//! values, and writes the ranges artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use census_map_catalog::Catalog;
use census_map_source::REQUIRED_COLUMNS;
use census_map_source::files::{discover_files, display_name};
use census_map_source::progress::{ProgressCallback, null_progress};
use census_map_source::reader::RowReader;
use census_map_staging::StagingStore;
use census_map_staging::snapshot::{load_snapshot, write_snapshot};
use census_map_statistics_models::{RangeMap, RunSummary};

use crate::aggregate::{Aggregator, AggregatorOptions};
use crate::filter::RowFilter;
use crate::range::{compute_ranges, write_ranges};
use crate::{StatisticsConfig, StatsError};

/// Progress indicators for the stages of a run.
#[derive(Clone)]
pub struct PipelineProgress {
    /// Advanced once per relevant record in both phases.
    pub records: Arc<dyn ProgressCallback>,
    /// Advanced once per attribute while computing ranges.
    pub attributes: Arc<dyn ProgressCallback>,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self {
            records: null_progress(),
            attributes: null_progress(),
        }
    }
}

/// Finds the input files and checks that each can be opened and has the
/// required columns.
///
/// # Errors
///
/// Returns [`StatsError::FileAccess`] for the first unusable file, or when
/// no file matches.
pub fn input_files(config: &StatisticsConfig) -> Result<Vec<PathBuf>, StatsError> {
    let files = discover_files(&config.data_dir, &config.file_pattern).map_err(|source| {
        StatsError::FileAccess {
            path: config.data_dir.clone(),
            source,
        }
    })?;

    for path in &files {
        RowReader::open(path, config.encoding)
            .and_then(|reader| reader.require_columns(REQUIRED_COLUMNS))
            .map_err(|source| StatsError::FileAccess {
                path: path.clone(),
                source,
            })?;
    }

    log::info!(
        "Found {} input file(s) in {}",
        files.len(),
        config.data_dir.display()
    );

    Ok(files)
}

/// Runs both phases and the range calculator against `store`.
///
/// Does not close `store`; see [`run_with_store`].
///
/// # Errors
///
/// Returns [`StatsError`] if an input file is unusable (before any phase
/// starts), if a pass fails, or if the artifact cannot be written.
pub async fn run(
    config: &StatisticsConfig,
    catalog: Arc<Catalog>,
    store: Arc<dyn StagingStore>,
    progress: &PipelineProgress,
) -> Result<RunSummary, StatsError> {
    config.validate()?;
    let started = Instant::now();
    let files = input_files(config)?;

    let aggregator = Aggregator::new(
        Arc::clone(&store),
        RowFilter::new(config.geo_level.clone(), Arc::clone(&catalog)),
        AggregatorOptions {
            concurrency: config.concurrency,
            lookup_batch_size: config.lookup_batch_size,
            encoding: config.encoding,
        },
        Arc::clone(&progress.records),
    );

    let raw = aggregator.run_raw(&files).await?;
    log::info!("Phase RAW complete: {} keys staged", store.len().await?);

    let final_pass = aggregator.run_final(&files).await?;
    progress.records.finish(format!("Staged values from {} file(s)", files.len()));
    log::info!("Phase FINAL complete");

    let ranges = compute_ranges(store.as_ref(), &catalog, &progress.attributes).await?;
    write_ranges(&ranges, &config.ranges_path)?;

    if let Some(snapshot) = &config.snapshot_path {
        write_snapshot(store.as_ref(), catalog.attributes().map(|a| a.id), snapshot).await?;
    }

    let with_data = ranges.values().filter(|r| r.is_some()).count();
    let summary = RunSummary {
        files: files.iter().map(|p| display_name(p)).collect(),
        raw,
        final_pass,
        attributes_with_data: with_data,
        attributes_without_data: ranges.len() - with_data,
        duration: started.elapsed(),
    };

    log::info!(
        "Run complete in {:.1}s: {} attribute(s) with data, {} without",
        summary.duration.as_secs_f64(),
        summary.attributes_with_data,
        summary.attributes_without_data
    );

    Ok(summary)
}

/// Opens the configured staging store, runs the pipeline, and closes the
/// store whether or not the run succeeded.
///
/// # Errors
///
/// Returns the run's error if it failed, otherwise any error from closing
/// the store.
pub async fn run_with_store(
    config: &StatisticsConfig,
    catalog: Arc<Catalog>,
    progress: &PipelineProgress,
) -> Result<RunSummary, StatsError> {
    config.validate()?;
    let store = census_map_staging::open(&config.staging).await?;

    let result = run(config, catalog, Arc::clone(&store), progress).await;
    let closed = store.close().await;

    match (result, closed) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_error)) => {
            log::error!("Failed to close staging store after a failed run: {close_error}");
            Err(e)
        }
    }
}

/// Recomputes the ranges artifact from a snapshot written by an earlier run.
///
/// # Errors
///
/// Returns [`StatsError`] if the snapshot cannot be read or the artifact
/// cannot be written.
pub async fn ranges_from_snapshot(
    snapshot: &Path,
    catalog: &Catalog,
    ranges_path: &Path,
    progress: &PipelineProgress,
) -> Result<RangeMap, StatsError> {
    let store = load_snapshot(snapshot).await?;
    let ranges = compute_ranges(&store, catalog, &progress.attributes).await?;
    write_ranges(&ranges, ranges_path)?;
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use census_map_staging::MemoryStore;
    use census_map_statistics_models::{AttributeRange, StagedKey};

    use super::*;

    const CATALOG: &str = r#"{
        "Total - Age groups": [
            { "id": 8, "name": "Total - Age groups", "divisor": null },
            { "id": 9, "name": "0 to 14 years", "divisor": 8 },
            { "id": 10, "name": "15 to 64 years", "divisor": 8 }
        ],
        "Average age": [
            { "id": 39, "name": "Average age of the population" }
        ]
    }"#;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(
            dir.join(name),
            format!("GEO_LEVEL,DGUID,CHARACTERISTIC_ID,CHARACTERISTIC_NAME,C1_COUNT_TOTAL\n{body}"),
        )
        .unwrap();
    }

    fn config(dir: &Path) -> StatisticsConfig {
        StatisticsConfig {
            data_dir: dir.join("census"),
            ranges_path: dir.join("output").join("ranges.json"),
            snapshot_path: Some(dir.join("output").join("staged.csv")),
            concurrency: 3,
            lookup_batch_size: 2,
            ..StatisticsConfig::default()
        }
    }

    #[tokio::test]
    async fn end_to_end_over_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let census = dir.path().join("census");
        std::fs::create_dir_all(&census).unwrap();

        write(
            &census,
            "98-401-X2021006_English_CSV_data_Atlantic.csv",
            "Country,2021A000011124,8,Total,36991980\n\
             Dissemination area,DA1,8,Total,200\n\
             Dissemination area,DA1,39,Average age,41.9\n\
             Dissemination area,DA2,8,Total,400\n",
        );
        write(
            &census,
            "98-401-X2021006_English_CSV_data_Ontario.csv",
            "Dissemination area,DA1,9,  0 to 14 years,50\n\
             Dissemination area,DA2,9,  0 to 14 years,100\n\
             Dissemination area,DA3,9,  0 to 14 years,7\n\
             Dissemination area,DA1,10,  15 to 64 years,..\n",
        );
        std::fs::write(census.join("README.txt"), "not census data").unwrap();

        let config = config(dir.path());
        let catalog = Arc::new(Catalog::from_json(CATALOG).unwrap());
        let store = Arc::new(MemoryStore::new());

        let summary = run(&config, catalog, store.clone(), &PipelineProgress::default())
            .await
            .unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.raw.iter().map(|p| p.records).sum::<u64>(), 6);
        assert_eq!(summary.raw.iter().map(|p| p.skipped).sum::<u64>(), 1);
        assert_eq!(summary.final_pass.iter().map(|p| p.ratios).sum::<u64>(), 2);
        assert_eq!(summary.final_pass.iter().map(|p| p.divisor_missing).sum::<u64>(), 1);
        assert_eq!(summary.attributes_with_data, 3);
        assert_eq!(summary.attributes_without_data, 1);

        assert_eq!(store.get(&StagedKey::new("DA1", 9)).await.unwrap(), Some(25.0));
        assert_eq!(store.get(&StagedKey::new("DA2", 9)).await.unwrap(), Some(25.0));
        assert_eq!(store.get(&StagedKey::new("DA3", 9)).await.unwrap(), Some(7.0));

        let ranges: RangeMap =
            serde_json::from_str(&std::fs::read_to_string(&config.ranges_path).unwrap()).unwrap();
        assert_eq!(ranges[&8], Some(AttributeRange { min: 200.0, max: 400.0 }));
        assert_eq!(ranges[&9], Some(AttributeRange { min: 7.0, max: 25.0 }));
        assert_eq!(ranges[&10], None);

        let snapshot = config.snapshot_path.as_deref().unwrap();
        let reloaded = ranges_from_snapshot(
            snapshot,
            &Catalog::from_json(CATALOG).unwrap(),
            &dir.path().join("again.json"),
            &PipelineProgress::default(),
        )
        .await
        .unwrap();
        assert_eq!(reloaded, ranges);
    }

    #[tokio::test]
    async fn missing_input_fails_before_any_phase() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let catalog = Arc::new(Catalog::from_json(CATALOG).unwrap());
        let store = Arc::new(MemoryStore::new());

        let err = run(&config, catalog, store.clone(), &PipelineProgress::default())
            .await
            .unwrap_err();

        assert!(matches!(err, StatsError::FileAccess { .. }));
        assert_eq!(store.len().await.unwrap(), 0);
        assert!(!config.ranges_path.exists());
    }

    #[tokio::test]
    async fn file_without_required_columns_fails_before_any_phase() {
        let dir = tempfile::tempdir().unwrap();
        let census = dir.path().join("census");
        std::fs::create_dir_all(&census).unwrap();
        write(&census, "a_English_CSV_data.csv", "Dissemination area,DA1,8,Total,200\n");
        std::fs::write(
            census.join("b_English_CSV_data.csv"),
            "GEO_LEVEL,DGUID\nDissemination area,DA1\n",
        )
        .unwrap();

        let config = config(dir.path());
        let catalog = Arc::new(Catalog::from_json(CATALOG).unwrap());
        let store = Arc::new(MemoryStore::new());

        let err = run(&config, catalog, store.clone(), &PipelineProgress::default())
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            StatsError::FileAccess { path, .. } if path.ends_with("b_English_CSV_data.csv")
        ));
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
