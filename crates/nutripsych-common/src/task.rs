//! Enrichment task identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One kind of AI enrichment applied to a food record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BrainNutrients,
    BioactiveCompounds,
    MentalHealthImpacts,
    NutrientInteractions,
}

#[derive(Debug, Error)]
#[error("unknown task type: {0}")]
pub struct ParseTaskTypeError(String);

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::BrainNutrients,
        TaskType::BioactiveCompounds,
        TaskType::MentalHealthImpacts,
        TaskType::NutrientInteractions,
    ];

    /// Serialize to the string used in templates, config and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BrainNutrients       => "brain_nutrients",
            TaskType::BioactiveCompounds   => "bioactive_compounds",
            TaskType::MentalHealthImpacts  => "mental_health_impacts",
            TaskType::NutrientInteractions => "nutrient_interactions",
        }
    }

    /// Template used for the prediction pass of this task type.
    pub fn default_template_id(&self) -> &'static str {
        match self {
            TaskType::BrainNutrients       => "brain_nutrient_prediction",
            TaskType::BioactiveCompounds   => "bioactive_compounds_prediction",
            TaskType::MentalHealthImpacts  => "mental_health_impacts",
            TaskType::NutrientInteractions => "nutrient_interactions",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ParseTaskTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brain_nutrients" | "brain-nutrients"             => Ok(TaskType::BrainNutrients),
            "bioactive_compounds" | "bioactive-compounds"     => Ok(TaskType::BioactiveCompounds),
            "mental_health_impacts" | "mental-health-impacts" => Ok(TaskType::MentalHealthImpacts),
            "nutrient_interactions" | "nutrient-interactions" => Ok(TaskType::NutrientInteractions),
            other => Err(ParseTaskTypeError(other.to_string())),
        }
    }
}
