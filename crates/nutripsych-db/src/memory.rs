//! In-memory store, used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use nutripsych_common::{FoodRecord, MergedEnrichment};
use tokio::sync::RwLock;

use crate::error::{DbError, Result};
use crate::store::{FoodFilter, FoodStore};

#[derive(Default)]
pub struct MemoryFoodStore {
    records: RwLock<BTreeMap<String, FoodRecord>>,
    commits: AtomicUsize,
}

impl MemoryFoodStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_records(records: impl IntoIterator<Item = FoodRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.food_id.clone(), r)).collect();
        Self { records: RwLock::new(map), commits: AtomicUsize::new(0) }
    }

    pub async fn insert(&self, record: FoodRecord) {
        self.records.write().await.insert(record.food_id.clone(), record);
    }

    pub async fn get(&self, food_id: &str) -> Option<FoodRecord> {
        self.records.read().await.get(food_id).cloned()
    }

    /// Number of successful `commit_enrichment` calls.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FoodStore for MemoryFoodStore {
    async fn read_food_record(&self, food_id: &str) -> Result<FoodRecord> {
        self.get(food_id).await.ok_or_else(|| DbError::NotFound(food_id.to_string()))
    }

    async fn commit_enrichment(
        &self,
        food_id: &str,
        merged: &MergedEnrichment,
        expected_version: u64,
    ) -> Result<u64> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(food_id)
            .ok_or_else(|| DbError::NotFound(food_id.to_string()))?;
        if record.metadata.version != expected_version {
            return Err(DbError::CommitConflict {
                food_id: food_id.to_string(),
                expected: expected_version,
                actual: record.metadata.version,
            });
        }
        let mut updated = record.clone();
        merged.apply_to(&mut updated);
        updated.metadata.version += 1;
        updated.metadata.last_updated = Utc::now();
        let version = updated.metadata.version;
        *record = updated;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn list_food_ids(&self, filter: &FoodFilter) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let ids = records.values()
            .filter(|r| filter.matches(r))
            .map(|r| r.food_id.clone())
            .collect();
        Ok(filter.finish(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutripsych_common::food::BrainNutrients;

    #[tokio::test]
    async fn test_commit_bumps_version() {
        let store = MemoryFoodStore::with_records([FoodRecord::new("f1", "Salmon", "Finfish")]);
        let merged = MergedEnrichment {
            brain_nutrients: Some(BrainNutrients { vitamin_d_mcg: Some(11.0), ..Default::default() }),
            ..Default::default()
        };
        let v = store.commit_enrichment("f1", &merged, 0).await.unwrap();
        assert_eq!(v, 1);
        assert_eq!(store.commit_count(), 1);
        assert!(store.get("f1").await.unwrap().brain_nutrients.is_some());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_and_leaves_record() {
        let store = MemoryFoodStore::with_records([FoodRecord::new("f1", "Salmon", "Finfish")]);
        let merged = MergedEnrichment {
            brain_nutrients: Some(BrainNutrients::default()),
            ..Default::default()
        };
        let err = store.commit_enrichment("f1", &merged, 3).await.unwrap_err();
        assert!(matches!(err, DbError::CommitConflict { expected: 3, actual: 0, .. }));
        assert!(store.get("f1").await.unwrap().brain_nutrients.is_none());
        assert_eq!(store.commit_count(), 0);
    }
}
