//! In-process staging store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use census_map_statistics_models::{AttributeId, StagedKey};
use tokio::sync::RwLock;

use crate::{StagingError, StagingStore};

/// Values grouped by attribute, then entity.
type Table = BTreeMap<AttributeId, BTreeMap<String, f64>>;

/// Staging store held in process memory.
///
/// Grouping by attribute makes [`StagingStore::entries_for_attribute`] a
/// direct lookup instead of a scan over every key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<Table>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn present(value: f64) -> Option<f64> {
    Some(value).filter(|v| !v.is_nan())
}

fn lookup(table: &Table, key: &StagedKey) -> Option<f64> {
    table
        .get(&key.attribute_id)
        .and_then(|entities| entities.get(&key.entity))
        .copied()
        .and_then(present)
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn put(&self, key: StagedKey, value: f64) -> Result<(), StagingError> {
        self.table
            .write()
            .await
            .entry(key.attribute_id)
            .or_default()
            .insert(key.entity, value);
        Ok(())
    }

    async fn put_many(&self, entries: Vec<(StagedKey, f64)>) -> Result<(), StagingError> {
        let mut table = self.table.write().await;
        for (key, value) in entries {
            table
                .entry(key.attribute_id)
                .or_default()
                .insert(key.entity, value);
        }
        Ok(())
    }

    async fn get(&self, key: &StagedKey) -> Result<Option<f64>, StagingError> {
        Ok(lookup(&*self.table.read().await, key))
    }

    async fn get_many(
        &self,
        keys: &[StagedKey],
    ) -> Result<BTreeMap<StagedKey, Option<f64>>, StagingError> {
        let table = self.table.read().await;
        Ok(keys
            .iter()
            .map(|key| (key.clone(), lookup(&table, key)))
            .collect())
    }

    async fn entries_for_attribute(
        &self,
        attribute_id: AttributeId,
    ) -> Result<Vec<(String, Option<f64>)>, StagingError> {
        Ok(self
            .table
            .read()
            .await
            .get(&attribute_id)
            .map(|entities| {
                entities
                    .iter()
                    .map(|(entity, &value)| (entity.clone(), present(value)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn values_for_attribute(
        &self,
        attribute_id: AttributeId,
    ) -> Result<Vec<Option<f64>>, StagingError> {
        Ok(self
            .table
            .read()
            .await
            .get(&attribute_id)
            .map(|entities| entities.values().copied().map(present).collect())
            .unwrap_or_default())
    }

    async fn len(&self) -> Result<u64, StagingError> {
        let table = self.table.read().await;
        Ok(table.values().map(|entities| entities.len() as u64).sum())
    }
}
