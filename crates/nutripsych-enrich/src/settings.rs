//! Per-task completion settings.

use std::collections::BTreeMap;

use nutripsych_llm::CompletionOptions;
use serde::{Deserialize, Serialize};

/// Model, temperature or token budget for one task label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOverride {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Base completion options plus overrides keyed by task label
/// (`brain_nutrients`, …, `confidence_calibration`).
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub base: CompletionOptions,
    pub per_task: BTreeMap<String, TaskOverride>,
}

impl ModelSettings {
    pub fn options_for(&self, label: &str) -> CompletionOptions {
        let mut opts = CompletionOptions { label: label.to_string(), ..self.base.clone() };
        if let Some(o) = self.per_task.get(label) {
            if let Some(model) = &o.model {
                opts.model = Some(model.clone());
            }
            if let Some(t) = o.temperature {
                opts.temperature = t;
            }
            if let Some(m) = o.max_tokens {
                opts.max_tokens = m;
            }
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_applies_only_to_its_task() {
        let settings = ModelSettings {
            base: CompletionOptions { temperature: 0.2, ..Default::default() },
            per_task: BTreeMap::from([(
                "confidence_calibration".to_string(),
                TaskOverride { model: Some("gpt-4o".into()), temperature: Some(0.1), max_tokens: None },
            )]),
        };
        let cal = settings.options_for("confidence_calibration");
        assert_eq!(cal.model.as_deref(), Some("gpt-4o"));
        assert_eq!(cal.temperature, 0.1);
        assert_eq!(cal.label, "confidence_calibration");

        let brain = settings.options_for("brain_nutrients");
        assert_eq!(brain.model, None);
        assert_eq!(brain.temperature, 0.2);
    }
}
