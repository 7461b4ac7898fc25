//! Directory-backed store: one `<food_id>.json` document per record.
//!
//! Commits are serialized through a single lock and written with a
//! temp-file-then-rename so a crashed commit never leaves a half-written
//! record behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use nutripsych_common::{FoodRecord, MergedEnrichment};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DbError, Result};
use crate::store::{FoodFilter, FoodStore};

const EXTENSION: &str = "json";

pub struct JsonDirStore {
    root: PathBuf,
    commit_lock: Mutex<()>,
}

impl JsonDirStore {
    /// Open or create a store rooted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !tokio::fs::try_exists(&root).await? {
            tokio::fs::create_dir_all(&root).await?;
            info!(path = %root.display(), "Created food record directory");
        }
        Ok(Self { root, commit_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, food_id: &str) -> Result<PathBuf> {
        if food_id.is_empty()
            || food_id.contains('/')
            || food_id.contains('\\')
            || food_id.contains("..")
        {
            return Err(DbError::InvalidId(food_id.to_string()));
        }
        Ok(self.root.join(format!("{food_id}.{EXTENSION}")))
    }

    /// Write a record outright, replacing any existing document.
    /// Used by import tooling and tests; enrichment goes through `commit_enrichment`.
    pub async fn put_record(&self, record: &FoodRecord) -> Result<()> {
        let path = self.record_path(&record.food_id)?;
        let _guard = self.commit_lock.lock().await;
        self.write_atomic(path, record).await
    }

    async fn load(&self, path: &Path, food_id: &str) -> Result<FoodRecord> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DbError::NotFound(food_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_atomic(&self, path: PathBuf, record: &FoodRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let dir = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| DbError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| DbError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl FoodStore for JsonDirStore {
    async fn read_food_record(&self, food_id: &str) -> Result<FoodRecord> {
        let path = self.record_path(food_id)?;
        self.load(&path, food_id).await
    }

    async fn commit_enrichment(
        &self,
        food_id: &str,
        merged: &MergedEnrichment,
        expected_version: u64,
    ) -> Result<u64> {
        let path = self.record_path(food_id)?;
        let _guard = self.commit_lock.lock().await;

        let mut record = self.load(&path, food_id).await?;
        if record.metadata.version != expected_version {
            warn!(
                food_id,
                expected = expected_version,
                actual = record.metadata.version,
                "Stale commit rejected"
            );
            return Err(DbError::CommitConflict {
                food_id: food_id.to_string(),
                expected: expected_version,
                actual: record.metadata.version,
            });
        }

        merged.apply_to(&mut record);
        record.metadata.version += 1;
        record.metadata.last_updated = Utc::now();
        let version = record.metadata.version;

        self.write_atomic(path, &record).await?;
        debug!(food_id, version, tasks = ?merged.task_types(), "Committed enrichment");
        Ok(version)
    }

    async fn list_food_ids(&self, filter: &FoodFilter) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !filter.food_ids.is_empty() && !filter.food_ids.iter().any(|id| id == stem) {
                continue;
            }
            match self.load(&path, stem).await {
                Ok(record) if filter.matches(&record) => ids.push(record.food_id),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(filter.finish(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutripsych_common::food::BrainNutrients;
    use nutripsych_common::TaskType;
    use pretty_assertions::assert_eq;

    async fn store_with(records: &[FoodRecord]) -> (tempfile::TempDir, JsonDirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();
        for r in records {
            store.put_record(r).await.unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let (_dir, store) = store_with(&[]).await;
        let err = store.read_food_record("nope").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_ids() {
        let (_dir, store) = store_with(&[]).await;
        assert!(matches!(
            store.read_food_record("../etc/passwd").await.unwrap_err(),
            DbError::InvalidId(_)
        ));
    }

    #[tokio::test]
    async fn test_commit_persists_and_bumps_version() {
        let (dir, store) = store_with(&[FoodRecord::new("usda_1", "Salmon, wild", "Finfish")]).await;
        let merged = MergedEnrichment {
            brain_nutrients: Some(BrainNutrients { vitamin_d_mcg: Some(11.0), ..Default::default() }),
            ..Default::default()
        };

        let version = store.commit_enrichment("usda_1", &merged, 0).await.unwrap();
        assert_eq!(version, 1);

        // A fresh handle sees the committed document.
        let reopened = JsonDirStore::open(dir.path()).await.unwrap();
        let record = reopened.read_food_record("usda_1").await.unwrap();
        assert_eq!(record.metadata.version, 1);
        assert_eq!(record.brain_nutrients.unwrap().vitamin_d_mcg, Some(11.0));
    }

    #[tokio::test]
    async fn test_stale_commit_leaves_document_untouched() {
        let original = FoodRecord::new("usda_1", "Salmon, wild", "Finfish");
        let (_dir, store) = store_with(std::slice::from_ref(&original)).await;
        let merged = MergedEnrichment {
            brain_nutrients: Some(BrainNutrients::default()),
            ..Default::default()
        };

        let err = store.commit_enrichment("usda_1", &merged, 7).await.unwrap_err();
        assert!(matches!(err, DbError::CommitConflict { expected: 7, actual: 0, .. }));
        assert_eq!(store.read_food_record("usda_1").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_list_applies_filter_and_limit() {
        let mut enriched = FoodRecord::new("c", "Kale", "Vegetables");
        enriched.brain_nutrients = Some(BrainNutrients::default());
        let (_dir, store) = store_with(&[
            FoodRecord::new("b", "Spinach", "Vegetables"),
            FoodRecord::new("a", "Broccoli", "Vegetables"),
            enriched,
            FoodRecord::new("d", "Salmon", "Finfish"),
        ])
        .await;

        let filter = FoodFilter {
            category: Some("vegetables".into()),
            missing_any_of: vec![TaskType::BrainNutrients],
            ..Default::default()
        };
        assert_eq!(store.list_food_ids(&filter).await.unwrap(), vec!["a", "b"]);

        let limited = FoodFilter { limit: Some(1), ..filter };
        assert_eq!(store.list_food_ids(&limited).await.unwrap(), vec!["a"]);
    }
}
