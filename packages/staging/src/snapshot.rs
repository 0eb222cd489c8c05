//! CSV snapshots of staged values.
//!
//! One line per key, no header: `<entity>-<attribute>,<value>`. Absent
//! values are written as `NaN`.

use std::path::Path;

use census_map_statistics_models::{AttributeId, StagedKey};

use crate::{MemoryStore, StagingError, StagingStore, decode_value, encode_value};

/// Writes every value staged for `attribute_ids` to `path`.
///
/// Returns the number of lines written.
///
/// # Errors
///
/// Returns [`StagingError`] if the store cannot be read or the file cannot
/// be written.
pub async fn write_snapshot(
    store: &dyn StagingStore,
    attribute_ids: impl IntoIterator<Item = AttributeId> + Send,
    path: &Path,
) -> Result<u64, StagingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut written = 0_u64;

    for attribute_id in attribute_ids {
        for (entity, value) in store.entries_for_attribute(attribute_id).await? {
            let key = StagedKey::new(entity, attribute_id);
            writer.write_record([key.to_string(), encode_value(value)])?;
            written += 1;
        }
    }

    writer.flush()?;

    log::info!("Wrote {written} staged values to {}", path.display());

    Ok(written)
}

/// Reads a snapshot into a fresh [`MemoryStore`].
///
/// Lines without exactly two fields or with an unparsable key are skipped
/// with a warning.
///
/// # Errors
///
/// Returns [`StagingError`] if the file cannot be opened or read.
pub async fn load_snapshot(path: &Path) -> Result<MemoryStore, StagingError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut entries = Vec::new();
    let mut skipped = 0_u64;

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let line = index + 1;

        let (Some(key), Some(value), None) = (record.get(0), record.get(1), record.get(2)) else {
            log::warn!("{}:{line}: expected `key,value`", path.display());
            skipped += 1;
            continue;
        };

        match key.parse::<StagedKey>() {
            Ok(key) => entries.push((key, decode_value(value).unwrap_or(f64::NAN))),
            Err(e) => {
                log::warn!("{}:{line}: {e}", path.display());
                skipped += 1;
            }
        }
    }

    let loaded = entries.len();
    let store = MemoryStore::new();
    store.put_many(entries).await?;

    log::info!(
        "Loaded {loaded} staged values from {} ({skipped} malformed line(s) skipped)",
        path.display()
    );

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_key_value_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.csv");

        let store = MemoryStore::new();
        store
            .put_many(vec![
                (StagedKey::new("2021S051210010001", 9), 25.0),
                (StagedKey::new("2021S051210010001", 8), 200.0),
                (StagedKey::new("2021S051210010002", 9), f64::NAN),
            ])
            .await
            .unwrap();

        let written = write_snapshot(&store, [8, 9], &path).await.unwrap();
        assert_eq!(written, 3);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "2021S051210010001-8,200\n2021S051210010001-9,25\n2021S051210010002-9,NaN\n"
        );
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.csv");
        std::fs::write(
            &path,
            "DA1-8,200\nno-key-here,1\nDA2-8,NaN\n-8,3\nDA3-8\nDA4-8,1,2\nDA5-9,12.5\n",
        )
        .unwrap();

        let store = load_snapshot(&path).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 3);
        assert_eq!(store.get(&StagedKey::new("DA1", 8)).await.unwrap(), Some(200.0));
        assert_eq!(store.get(&StagedKey::new("DA2", 8)).await.unwrap(), None);
        assert_eq!(store.get(&StagedKey::new("DA5", 9)).await.unwrap(), Some(12.5));
    }
}
