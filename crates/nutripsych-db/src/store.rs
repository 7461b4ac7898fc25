//! Store trait and record filter.

use async_trait::async_trait;
use nutripsych_common::{FoodRecord, MergedEnrichment, TaskType};

use crate::error::Result;

/// Persistence boundary of the enrichment pipeline.
#[async_trait]
pub trait FoodStore: Send + Sync {
    async fn read_food_record(&self, food_id: &str) -> Result<FoodRecord>;

    /// Apply `merged` to the stored record in one transactional write.
    ///
    /// Fails with `DbError::CommitConflict` when the stored version is no
    /// longer `expected_version`. Returns the new version.
    async fn commit_enrichment(
        &self,
        food_id: &str,
        merged: &MergedEnrichment,
        expected_version: u64,
    ) -> Result<u64>;

    /// Ids of records matching `filter`, sorted.
    async fn list_food_ids(&self, filter: &FoodFilter) -> Result<Vec<String>>;
}

/// Selection of records for a batch run.
#[derive(Debug, Clone, Default)]
pub struct FoodFilter {
    /// Explicit ids; empty means "any".
    pub food_ids: Vec<String>,
    pub category: Option<String>,
    pub name_contains: Option<String>,
    /// Keep only records lacking at least one of these enrichments.
    /// Empty means no enrichment-based filtering (forced reprocessing).
    pub missing_any_of: Vec<TaskType>,
    pub limit: Option<usize>,
}

impl FoodFilter {
    pub fn matches(&self, record: &FoodRecord) -> bool {
        if !self.food_ids.is_empty() && !self.food_ids.iter().any(|id| id == &record.food_id) {
            return false;
        }
        if let Some(cat) = &self.category {
            if !record.category.eq_ignore_ascii_case(cat) {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !record.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if !self.missing_any_of.is_empty()
            && self.missing_any_of.iter().all(|t| record.has_enrichment(*t))
        {
            return false;
        }
        true
    }

    /// Sort and truncate matched ids.
    pub(crate) fn finish(&self, mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        if let Some(limit) = self.limit {
            ids.truncate(limit);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutripsych_common::food::BrainNutrients;

    #[test]
    fn test_category_match_is_case_insensitive() {
        let record = FoodRecord::new("f1", "Salmon, wild", "Finfish");
        let filter = FoodFilter { category: Some("finfish".into()), ..Default::default() };
        assert!(filter.matches(&record));
    }

    #[test]
    fn test_missing_filter_skips_fully_enriched() {
        let mut record = FoodRecord::new("f1", "Salmon, wild", "Finfish");
        record.brain_nutrients = Some(BrainNutrients::default());
        let only_brain = FoodFilter {
            missing_any_of: vec![TaskType::BrainNutrients],
            ..Default::default()
        };
        assert!(!only_brain.matches(&record));

        let both = FoodFilter {
            missing_any_of: vec![TaskType::BrainNutrients, TaskType::MentalHealthImpacts],
            ..Default::default()
        };
        assert!(both.matches(&record));
    }
}
