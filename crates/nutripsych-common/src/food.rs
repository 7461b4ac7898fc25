//! Food record types mirroring the persisted nutrition document.
//! The enrichment pipeline only ever holds a working copy of a record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskType;

/// Data-source tag written when an enrichment subtree comes from the model.
pub const AI_GENERATED: &str = "ai_generated";

// ---------------------------------------------------------------------------
// Food record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodRecord {
    pub food_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub serving_info: ServingInfo,
    #[serde(default)]
    pub standard_nutrients: StandardNutrients,
    #[serde(default)]
    pub brain_nutrients: Option<BrainNutrients>,
    #[serde(default)]
    pub bioactive_compounds: Option<BioactiveCompounds>,
    #[serde(default)]
    pub mental_health_impacts: Vec<MentalHealthImpact>,
    #[serde(default)]
    pub nutrient_interactions: Vec<NutrientInteraction>,
    #[serde(default)]
    pub contextual_factors: Option<ContextualFactors>,
    #[serde(default)]
    pub inflammatory_index: Option<InflammatoryIndex>,
    #[serde(default)]
    pub data_quality: DataQuality,
    #[serde(default)]
    pub metadata: Metadata,
}

impl FoodRecord {
    pub fn new(food_id: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            food_id: food_id.into(),
            name: name.into(),
            description: None,
            category: category.into(),
            serving_info: ServingInfo::default(),
            standard_nutrients: StandardNutrients::default(),
            brain_nutrients: None,
            bioactive_compounds: None,
            mental_health_impacts: Vec::new(),
            nutrient_interactions: Vec::new(),
            contextual_factors: None,
            inflammatory_index: None,
            data_quality: DataQuality::default(),
            metadata: Metadata::default(),
        }
    }

    /// Does the record already carry output for this task type?
    pub fn has_enrichment(&self, task: TaskType) -> bool {
        match task {
            TaskType::BrainNutrients       => self.brain_nutrients.is_some(),
            TaskType::BioactiveCompounds   => self.bioactive_compounds.is_some(),
            TaskType::MentalHealthImpacts  => !self.mental_health_impacts.is_empty(),
            TaskType::NutrientInteractions => !self.nutrient_interactions.is_empty(),
        }
    }

    /// Existing enrichment for a task type, in the shape the model returns it.
    pub fn enrichment_json(&self, task: TaskType) -> Option<Value> {
        if !self.has_enrichment(task) {
            return None;
        }
        let value = match task {
            TaskType::BrainNutrients       => serde_json::to_value(&self.brain_nutrients),
            TaskType::BioactiveCompounds   => serde_json::to_value(&self.bioactive_compounds),
            TaskType::MentalHealthImpacts  => serde_json::to_value(ImpactList {
                impacts: self.mental_health_impacts.clone(),
            }),
            TaskType::NutrientInteractions => serde_json::to_value(InteractionList {
                interactions: self.nutrient_interactions.clone(),
            }),
        };
        value.ok()
    }

    /// Fraction of enrichment subtrees present, in [0, 1].
    pub fn enrichment_completeness(&self) -> f64 {
        let present = TaskType::ALL.iter().filter(|t| self.has_enrichment(**t)).count();
        present as f64 / TaskType::ALL.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Base nutrition (imported, never touched by enrichment)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServingInfo {
    pub serving_size: Option<f64>,
    pub serving_unit: Option<String>,
    pub household_serving: Option<String>,
}

/// Standard nutrients per 100 g.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardNutrients {
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbohydrates_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sugars_g: Option<f64>,
    pub calcium_mg: Option<f64>,
    pub iron_mg: Option<f64>,
    pub magnesium_mg: Option<f64>,
    pub potassium_mg: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub zinc_mg: Option<f64>,
    pub vitamin_c_mg: Option<f64>,
}

// ---------------------------------------------------------------------------
// Brain nutrients
// ---------------------------------------------------------------------------

/// Brain-relevant nutrients per 100 g. Every amount has a sibling
/// `_confidence` score on the 1–10 scale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrainNutrients {
    pub tryptophan_mg: Option<f64>,
    pub tryptophan_mg_confidence: Option<f64>,
    pub tyrosine_mg: Option<f64>,
    pub tyrosine_mg_confidence: Option<f64>,
    pub vitamin_b6_mg: Option<f64>,
    pub vitamin_b6_mg_confidence: Option<f64>,
    pub folate_mcg: Option<f64>,
    pub folate_mcg_confidence: Option<f64>,
    pub vitamin_b12_mcg: Option<f64>,
    pub vitamin_b12_mcg_confidence: Option<f64>,
    pub vitamin_d_mcg: Option<f64>,
    pub vitamin_d_mcg_confidence: Option<f64>,
    pub magnesium_mg: Option<f64>,
    pub magnesium_mg_confidence: Option<f64>,
    pub zinc_mg: Option<f64>,
    pub zinc_mg_confidence: Option<f64>,
    pub iron_mg: Option<f64>,
    pub iron_mg_confidence: Option<f64>,
    pub selenium_mcg: Option<f64>,
    pub selenium_mcg_confidence: Option<f64>,
    pub choline_mg: Option<f64>,
    pub choline_mg_confidence: Option<f64>,
    pub omega3: Option<Omega3>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Omega3 {
    pub total_g: Option<f64>,
    pub total_g_confidence: Option<f64>,
    pub epa_mg: Option<f64>,
    pub epa_mg_confidence: Option<f64>,
    pub dha_mg: Option<f64>,
    pub dha_mg_confidence: Option<f64>,
    pub ala_mg: Option<f64>,
    pub ala_mg_confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bioactive compounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BioactiveCompounds {
    pub polyphenols_mg: Option<f64>,
    pub polyphenols_mg_confidence: Option<f64>,
    pub flavonoids_mg: Option<f64>,
    pub flavonoids_mg_confidence: Option<f64>,
    pub anthocyanins_mg: Option<f64>,
    pub anthocyanins_mg_confidence: Option<f64>,
    pub carotenoids_mg: Option<f64>,
    pub carotenoids_mg_confidence: Option<f64>,
    pub probiotics_cfu: Option<f64>,
    pub probiotics_cfu_confidence: Option<f64>,
    pub prebiotic_fiber_g: Option<f64>,
    pub prebiotic_fiber_g_confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Mental health impacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactDirection {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentalHealthImpact {
    pub impact_type: String,       // e.g. mood_depression, cognitive_function
    pub direction: ImpactDirection,
    pub mechanism: String,
    pub strength: f64,             // 1–10
    pub confidence: f64,           // 1–10
    pub time_to_effect: Option<String>,
    pub research_context: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Nutrient interactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Synergistic,
    Antagonistic,
    Competitive,
    Cofactor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientInteraction {
    pub nutrients: Vec<String>,
    pub interaction_type: InteractionType,
    pub pathway: String,
    pub mechanism: String,
    pub mental_health_relevance: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub citations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImpactList {
    impacts: Vec<MentalHealthImpact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InteractionList {
    interactions: Vec<NutrientInteraction>,
}

// ---------------------------------------------------------------------------
// Carried context, quality and metadata blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextualFactors {
    pub meal_timing: Option<String>,
    pub preparation_effects: Option<String>,
    #[serde(default)]
    pub synergistic_foods: Vec<String>,
    pub population_notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InflammatoryIndex {
    pub value: Option<f64>,
    pub confidence: Option<f64>,
    pub calculation_method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub completeness: Option<f64>,
    pub standard_nutrients_source: Option<String>,
    pub brain_nutrients_source: Option<String>,
    pub bioactives_source: Option<String>,
    pub impacts_source: Option<String>,
    pub interactions_source: Option<String>,
    pub last_calibrated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calibration_notes: BTreeMap<TaskType, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Optimistic-concurrency token, bumped by the store on every commit.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub source_urls: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            created_at: now,
            last_updated: now,
            source_urls: Vec::new(),
            tags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merged enrichment (unit of commit)
// ---------------------------------------------------------------------------

/// All task outputs for one record, written in a single commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedEnrichment {
    pub brain_nutrients: Option<BrainNutrients>,
    pub bioactive_compounds: Option<BioactiveCompounds>,
    pub mental_health_impacts: Option<Vec<MentalHealthImpact>>,
    pub nutrient_interactions: Option<Vec<NutrientInteraction>>,
    pub calibration_notes: BTreeMap<TaskType, Vec<String>>,
    pub calibrated_at: Option<DateTime<Utc>>,
}

impl MergedEnrichment {
    /// Deserialize a validated payload into its typed subtree.
    pub fn insert(&mut self, task: TaskType, payload: Value) -> Result<(), serde_json::Error> {
        match task {
            TaskType::BrainNutrients => {
                self.brain_nutrients = Some(serde_json::from_value(payload)?);
            }
            TaskType::BioactiveCompounds => {
                self.bioactive_compounds = Some(serde_json::from_value(payload)?);
            }
            TaskType::MentalHealthImpacts => {
                let list: ImpactList = serde_json::from_value(payload)?;
                self.mental_health_impacts = Some(list.impacts);
            }
            TaskType::NutrientInteractions => {
                let list: InteractionList = serde_json::from_value(payload)?;
                self.nutrient_interactions = Some(list.interactions);
            }
        }
        Ok(())
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut out = Vec::new();
        if self.brain_nutrients.is_some()       { out.push(TaskType::BrainNutrients); }
        if self.bioactive_compounds.is_some()   { out.push(TaskType::BioactiveCompounds); }
        if self.mental_health_impacts.is_some() { out.push(TaskType::MentalHealthImpacts); }
        if self.nutrient_interactions.is_some() { out.push(TaskType::NutrientInteractions); }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.task_types().is_empty()
    }

    /// Write every present subtree onto the record and update its quality block.
    /// Field groups absent from the merge are left untouched.
    pub fn apply_to(&self, record: &mut FoodRecord) {
        let dq = &mut record.data_quality;
        if let Some(b) = &self.brain_nutrients {
            record.brain_nutrients = Some(b.clone());
            dq.brain_nutrients_source = Some(AI_GENERATED.to_string());
        }
        if let Some(b) = &self.bioactive_compounds {
            record.bioactive_compounds = Some(b.clone());
            dq.bioactives_source = Some(AI_GENERATED.to_string());
        }
        if let Some(i) = &self.mental_health_impacts {
            record.mental_health_impacts = i.clone();
            dq.impacts_source = Some(AI_GENERATED.to_string());
        }
        if let Some(i) = &self.nutrient_interactions {
            record.nutrient_interactions = i.clone();
            dq.interactions_source = Some(AI_GENERATED.to_string());
        }
        for (task, notes) in &self.calibration_notes {
            dq.calibration_notes.insert(*task, notes.clone());
        }
        if self.calibrated_at.is_some() {
            dq.last_calibrated = self.calibrated_at;
        }
        record.data_quality.completeness = Some(record.enrichment_completeness());
    }
}
