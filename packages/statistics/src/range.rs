//! Range calculator.
//!
//! Derives a `{min, max}` per attribute from its final staged values after
//! discarding outliers. Trimming is adaptive: 5% from each end, falling back
//! to 1% and then to no trimming while the trimmed maximum stays below 1,
//! so attributes whose values cluster near zero keep an informative range.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use census_map_catalog::Catalog;
use census_map_source::progress::ProgressCallback;
use census_map_staging::StagingStore;
use census_map_statistics_models::{AttributeRange, RangeMap};

use crate::{StatsError, paths};

/// Trim fractions tried in order.
pub const TRIM_STEPS: [f64; 3] = [0.05, 0.01, 0.0];

/// Upper bound of a percentage.
const MAX_PERCENT: f64 = 100.0;

/// Drops the lowest and highest `floor(len * fraction)` values of `sorted`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn trim(sorted: &[f64], fraction: f64) -> &[f64] {
    let cut = (sorted.len() as f64 * fraction).floor() as usize;
    if cut * 2 >= sorted.len() {
        return sorted;
    }
    &sorted[cut..sorted.len() - cut]
}

/// Range of ascending `sorted` values after adaptive trimming.
///
/// Ratio attributes have both bounds clamped into `[0, 100]`. Returns `None`
/// when there are no values.
#[must_use]
pub fn trimmed_range(sorted: &[f64], is_ratio: bool) -> Option<AttributeRange> {
    let mut chosen = sorted;
    for fraction in TRIM_STEPS {
        chosen = trim(sorted, fraction);
        if chosen.last().is_some_and(|&max| max >= 1.0) {
            break;
        }
    }

    let (&min, &max) = (chosen.first()?, chosen.last()?);

    Some(if is_ratio {
        AttributeRange {
            min: min.clamp(0.0, MAX_PERCENT),
            max: max.clamp(0.0, MAX_PERCENT),
        }
    } else {
        AttributeRange { min, max }
    })
}

/// Computes the range of every catalog attribute from the staging store.
///
/// Absent and non-finite values are ignored. Attributes without any value
/// map to `None`.
///
/// # Errors
///
/// Returns [`StatsError::Staging`] if the store cannot be read.
pub async fn compute_ranges(
    store: &dyn StagingStore,
    catalog: &Catalog,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<RangeMap, StatsError> {
    progress.set_total(catalog.len() as u64);
    progress.set_message("Computing attribute ranges".to_string());

    let mut ranges = RangeMap::new();

    for attribute in catalog.attributes() {
        let mut values: Vec<f64> = store
            .values_for_attribute(attribute.id)
            .await?
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .collect();
        values.sort_by(f64::total_cmp);

        let range = trimmed_range(&values, attribute.is_ratio());

        match range {
            Some(AttributeRange { min, max }) => log::info!(
                "Attribute {} ({}): [{min}, {max}] from {} values",
                attribute.id,
                attribute.name,
                values.len()
            ),
            None => log::info!("Attribute {} ({}): no data", attribute.id, attribute.name),
        }

        ranges.insert(attribute.id, range);
        progress.inc(1);
    }

    progress.finish(format!("Computed {} attribute ranges", ranges.len()));

    Ok(ranges)
}

/// Writes `ranges` as JSON to `path`, replacing the previous artifact.
///
/// The file is written next to `path` first and renamed into place, so a
/// failed write never leaves a truncated artifact.
///
/// # Errors
///
/// Returns [`StatsError`] if serialization or the write fails.
pub fn write_ranges(ranges: &RangeMap, path: &Path) -> Result<(), StatsError> {
    paths::ensure_parent(path)?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, ranges)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    log::info!("Wrote {} attribute ranges to {}", ranges.len(), path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use census_map_source::progress::null_progress;
    use census_map_staging::MemoryStore;
    use census_map_statistics_models::StagedKey;

    use super::*;

    #[test]
    fn trims_five_percent_when_informative() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(
            trimmed_range(&values, false),
            Some(AttributeRange { min: 6.0, max: 95.0 })
        );
    }

    #[test]
    fn falls_back_through_every_trim_step() {
        let mut values = vec![0.0; 297];
        values.extend([45.0, 46.0, 47.0]);

        assert!(trim(&values, 0.05).last().copied().unwrap() < 1.0);
        assert!(trim(&values, 0.01).last().copied().unwrap() < 1.0);
        assert_eq!(
            trimmed_range(&values, true),
            Some(AttributeRange { min: 0.0, max: 47.0 })
        );
    }

    #[test]
    fn stops_at_one_percent_when_that_is_enough() {
        let mut values = vec![0.0; 97];
        values.extend([45.0, 46.0, 47.0]);

        assert_eq!(
            trimmed_range(&values, true),
            Some(AttributeRange { min: 0.0, max: 46.0 })
        );
    }

    #[test]
    fn clamps_ratio_bounds() {
        assert_eq!(
            trimmed_range(&[-3.0, 250.0], true),
            Some(AttributeRange { min: 0.0, max: 100.0 })
        );
        assert_eq!(
            trimmed_range(&[120.0, 130.0], true),
            Some(AttributeRange { min: 100.0, max: 100.0 })
        );
        assert_eq!(
            trimmed_range(&[-3.0, 250.0], false),
            Some(AttributeRange { min: -3.0, max: 250.0 })
        );
    }

    #[test]
    fn no_values_is_no_data() {
        assert_eq!(trimmed_range(&[], false), None);
        assert_eq!(trimmed_range(&[], true), None);
    }

    #[tokio::test]
    async fn computes_every_catalog_attribute() {
        let catalog = Catalog::from_json(
            r#"{ "Households": [
                { "id": 50, "name": "Total - Households" },
                { "id": 51, "name": "One person", "divisor": 50 },
                { "id": 52, "name": "Two persons", "divisor": 50 }
            ] }"#,
        )
        .unwrap();

        let store = MemoryStore::new();
        store
            .put_many(vec![
                (StagedKey::new("DA1", 50), 200.0),
                (StagedKey::new("DA2", 50), 10.0),
                (StagedKey::new("DA3", 50), f64::NAN),
                (StagedKey::new("DA1", 51), 25.0),
                (StagedKey::new("DA2", 51), 140.0),
            ])
            .await
            .unwrap();

        let ranges = compute_ranges(&store, &catalog, &null_progress()).await.unwrap();

        assert_eq!(ranges[&50], Some(AttributeRange { min: 10.0, max: 200.0 }));
        assert_eq!(ranges[&51], Some(AttributeRange { min: 25.0, max: 100.0 }));
        assert_eq!(ranges[&52], None);
    }

    #[test]
    fn write_replaces_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("ranges.json");

        let first = RangeMap::from([(1, Some(AttributeRange { min: 0.0, max: 5.0 }))]);
        write_ranges(&first, &path).unwrap();

        let second = RangeMap::from([(2, None)]);
        write_ranges(&second, &path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, serde_json::json!({ "2": null }));
    }
}
