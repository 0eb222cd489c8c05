//! Durable staging store in a `DuckDB` file.
//!
//! Values are stored as text via [`crate::encode_value`] so an absent value
//! round-trips as the literal `"NaN"`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use census_map_statistics_models::{AttributeId, StagedKey};
use duckdb::Connection;

use crate::{StagingError, StagingStore, decode_value, encode_value};

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO staged_values (entity, attribute_id, value)
     VALUES (?, ?, ?)";

const SELECT_SQL: &str = "SELECT value FROM staged_values WHERE entity = ? AND attribute_id = ?";

/// Staging store backed by a single `DuckDB` connection.
///
/// `duckdb::Connection` is `Send` but not `Sync`, so it sits behind a
/// `Mutex`. Each call holds the lock for one statement or one batch.
pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    /// Opens (or creates) the store at `path` and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, StagingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a store that lives only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StagingError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StagingError> {
        conn.execute_batch(
            "SET threads = 4;
             SET memory_limit = '1GB';

             CREATE TABLE IF NOT EXISTS staged_values (
                 entity TEXT NOT NULL,
                 attribute_id INTEGER NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (entity, attribute_id)
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Connection>, StagingError> {
        self.conn.lock().map_err(|_| StagingError::Poisoned)
    }
}

#[async_trait]
impl StagingStore for DuckDbStore {
    async fn put(&self, key: StagedKey, value: f64) -> Result<(), StagingError> {
        let conn = self.acquire()?;
        conn.execute(
            UPSERT_SQL,
            duckdb::params![key.entity, key.attribute_id, encode_value(Some(value))],
        )?;
        Ok(())
    }

    async fn put_many(&self, entries: Vec<(StagedKey, f64)>) -> Result<(), StagingError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.acquire()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_SQL)?;
            for (key, value) in &entries {
                stmt.execute(duckdb::params![
                    key.entity,
                    key.attribute_id,
                    encode_value(Some(*value))
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, key: &StagedKey) -> Result<Option<f64>, StagingError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(SELECT_SQL)?;
        match stmt.query_row(duckdb::params![key.entity, key.attribute_id], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(text) => Ok(decode_value(&text)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_many(
        &self,
        keys: &[StagedKey],
    ) -> Result<BTreeMap<StagedKey, Option<f64>>, StagingError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(SELECT_SQL)?;
        let mut values = BTreeMap::new();

        for key in keys {
            let value = match stmt.query_row(duckdb::params![key.entity, key.attribute_id], |row| {
                row.get::<_, String>(0)
            }) {
                Ok(text) => decode_value(&text),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            values.insert(key.clone(), value);
        }

        Ok(values)
    }

    async fn entries_for_attribute(
        &self,
        attribute_id: AttributeId,
    ) -> Result<Vec<(String, Option<f64>)>, StagingError> {
        let conn = self.acquire()?;
        let mut stmt =
            conn.prepare("SELECT entity, value FROM staged_values WHERE attribute_id = ?")?;

        let rows = stmt.query_map([attribute_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entity, text) = row?;
            entries.push((entity, decode_value(&text)));
        }

        Ok(entries)
    }

    async fn len(&self) -> Result<u64, StagingError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM staged_values")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) -> Result<(), StagingError> {
        self.acquire()?.execute_batch("CHECKPOINT;")?;
        log::debug!("DuckDB staging store checkpointed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overwrites_and_reads_back() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let key = StagedKey::new("DA1", 8);

        store.put(key.clone(), 50.0).await.unwrap();
        store.put(key.clone(), 25.0).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), Some(25.0));
        assert_eq!(store.get(&StagedKey::new("DA2", 8)).await.unwrap(), None);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nan_text_reads_back_as_absent() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store
            .put_many(vec![
                (StagedKey::new("DA1", 8), 10.0),
                (StagedKey::new("DA2", 8), f64::NAN),
            ])
            .await
            .unwrap();

        let keys = [StagedKey::new("DA1", 8), StagedKey::new("DA2", 8)];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(values[&keys[0]], Some(10.0));
        assert_eq!(values[&keys[1]], None);

        let mut entries = store.entries_for_attribute(8).await.unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            [("DA1".to_string(), Some(10.0)), ("DA2".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.duckdb");

        {
            let store = DuckDbStore::open(&path).unwrap();
            store.put(StagedKey::new("DA1", 9), 3.5).await.unwrap();
            store.close().await.unwrap();
        }

        let store = DuckDbStore::open(&path).unwrap();
        assert_eq!(store.get(&StagedKey::new("DA1", 9)).await.unwrap(), Some(3.5));
    }
}
