//! Prompt template store and renderer.
//!
//! Templates are JSON documents (one per template) holding a system prompt,
//! a user prompt with `{{ slot }}` placeholders and `{% if slot %}` sections,
//! validation criteria and an optional known-answer fixture. The built-in
//! set is embedded in the binary and loaded once per process; a directory of
//! overrides can replace or extend it at startup. Nothing is reloaded
//! mid-run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use minijinja::{Environment, UndefinedBehavior, Value as JinjaValue};
use nutripsych_common::{Direction, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EnrichError, Result};

pub const CALIBRATION_TEMPLATE_ID: &str = "confidence_calibration";

const BUILTIN_SOURCES: [(&str, &str); 5] = [
    ("brain_nutrient_prediction", include_str!("../templates/brain_nutrient_prediction.json")),
    ("bioactive_compounds_prediction", include_str!("../templates/bioactive_compounds_prediction.json")),
    ("mental_health_impacts", include_str!("../templates/mental_health_impacts.json")),
    ("nutrient_interactions", include_str!("../templates/nutrient_interactions.json")),
    ("confidence_calibration", include_str!("../templates/confidence_calibration.json")),
];

// ── Template definitions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStage {
    Prediction,
    Calibration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAnswerFixture {
    /// Slot values used to render the template under test.
    pub input_parameters: BTreeMap<String, Value>,
    /// Confidence values to compare against. When absent, the confidences
    /// found in the `generated_data_json` input parameter are used.
    #[serde(default)]
    pub baseline: Option<BTreeMap<String, f64>>,
    pub expected_outputs: BTreeMap<String, Direction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template_id: String,
    pub version: String,
    pub description: String,
    pub stage: TemplateStage,
    /// Task produced by a prediction template. Calibration templates take
    /// the task from their `data_type` slot instead.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    pub system_prompt: String,
    pub user_prompt_template: String,
    /// Slots that render as `none` when no value is supplied.
    #[serde(default)]
    pub optional_slots: BTreeSet<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub validation_criteria: Vec<String>,
    #[serde(default)]
    pub known_answer_test: Option<KnownAnswerFixture>,
}

impl PromptTemplate {
    fn system_name(&self) -> String { format!("{}.system", self.template_id) }
    fn user_name(&self) -> String { format!("{}.user", self.template_id) }
}

// ── Slot values ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Text(String),
    /// Interpolated verbatim as pretty-printed JSON with sorted keys.
    Json(Value),
}

impl SlotValue {
    /// Plain strings become text, everything else JSON.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => SlotValue::Text(s.clone()),
            other => SlotValue::Json(other.clone()),
        }
    }

    fn to_jinja(&self) -> Result<JinjaValue> {
        Ok(match self {
            SlotValue::Text(s) => JinjaValue::from(s.as_str()),
            SlotValue::Json(Value::Null) => JinjaValue::from(()),
            SlotValue::Json(v) => JinjaValue::from(serde_json::to_string_pretty(&sorted(v))?),
        })
    }
}

/// Copy of `value` with object keys in lexical order at every level.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Named slot values for one render call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slots(BTreeMap<String, SlotValue>);

impl Slots {
    pub fn new() -> Self { Self::default() }

    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), SlotValue::Text(value.into()));
        self
    }

    pub fn json(mut self, name: &str, value: Value) -> Self {
        self.0.insert(name.to_string(), SlotValue::Json(value));
        self
    }

    /// Set the slot only when a value is present.
    pub fn maybe_json(self, name: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.json(name, v),
            None => self,
        }
    }

    pub fn maybe_text(self, name: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.text(name, v),
            None => self,
        }
    }

    pub fn get(&self, name: &str) -> Option<&SlotValue> {
        self.0.get(name)
    }

    pub fn from_parameters(params: &BTreeMap<String, Value>) -> Self {
        Self(params.iter().map(|(k, v)| (k.clone(), SlotValue::from_json(v))).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Read-only lookup of templates by id, with their compiled prompt sources.
pub struct TemplateStore {
    env: Environment<'static>,
    templates: BTreeMap<String, PromptTemplate>,
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .finish()
    }
}

static BUILTIN: OnceLock<std::result::Result<Arc<TemplateStore>, String>> = OnceLock::new();

impl TemplateStore {
    pub fn from_templates(templates: impl IntoIterator<Item = PromptTemplate>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let mut by_id = BTreeMap::new();
        for t in templates {
            env.add_template_owned(t.system_name(), t.system_prompt.clone())?;
            env.add_template_owned(t.user_name(), t.user_prompt_template.clone())?;
            by_id.insert(t.template_id.clone(), t);
        }
        Ok(Self { env, templates: by_id })
    }

    /// The embedded template set, parsed on first use.
    pub fn builtin() -> Result<Arc<TemplateStore>> {
        BUILTIN
            .get_or_init(|| {
                builtin_templates()
                    .and_then(TemplateStore::from_templates)
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(|reason| EnrichError::InvalidTemplate {
                template_id: "<builtin>".to_string(),
                reason,
            })
    }

    /// Built-in templates, with any `*.json` in `dir` replacing the built-in
    /// template of the same id.
    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut templates: BTreeMap<String, PromptTemplate> = builtin_templates()?
            .into_iter()
            .map(|t| (t.template_id.clone(), t))
            .collect();
        for t in load_dir(dir)? {
            info!(template_id = %t.template_id, version = %t.version, "Template override loaded");
            templates.insert(t.template_id.clone(), t);
        }
        Self::from_templates(templates.into_values())
    }

    pub fn get(&self, template_id: &str) -> Result<&PromptTemplate> {
        self.templates
            .get(template_id)
            .ok_or_else(|| EnrichError::TemplateNotFound(template_id.to_string()))
    }

    pub fn templates(&self) -> impl Iterator<Item = &PromptTemplate> {
        self.templates.values()
    }

    /// Prediction template for a task type.
    pub fn for_task(&self, task: TaskType) -> Result<&PromptTemplate> {
        self.get(task.default_template_id())
    }

    /// Every slot referenced by either prompt of the template.
    pub fn referenced_slots(&self, template_id: &str) -> Result<BTreeSet<String>> {
        let t = self.get(template_id)?;
        let mut slots = BTreeSet::new();
        for name in [t.system_name(), t.user_name()] {
            slots.extend(self.env.get_template(&name)?.undeclared_variables(false));
        }
        Ok(slots)
    }

    /// Render a template's prompt pair.
    ///
    /// Each referenced slot resolves to the supplied value, then the
    /// template's default, then `none` if the slot is optional. Anything
    /// left unresolved is reported in a single `MissingSlot` error.
    pub fn render(&self, template_id: &str, slots: &Slots) -> Result<RenderedPrompt> {
        let template = self.get(template_id)?;
        let mut ctx: BTreeMap<String, JinjaValue> = BTreeMap::new();
        let mut missing = Vec::new();

        for name in self.referenced_slots(template_id)? {
            let value = if let Some(v) = slots.get(&name) {
                v.to_jinja()?
            } else if let Some(d) = template.defaults.get(&name) {
                SlotValue::from_json(d).to_jinja()?
            } else if template.optional_slots.contains(&name) {
                JinjaValue::from(())
            } else {
                missing.push(name);
                continue;
            };
            ctx.insert(name, value);
        }

        if !missing.is_empty() {
            return Err(EnrichError::MissingSlot {
                template_id: template_id.to_string(),
                slots: missing,
            });
        }

        let system = self.env.get_template(&template.system_name())?.render(&ctx)?;
        let user = self.env.get_template(&template.user_name())?.render(&ctx)?;
        debug!(template_id, version = %template.version, user_len = user.len(), "Rendered prompt");
        Ok(RenderedPrompt { system, user })
    }
}

fn parse_template(source: &str, origin: &str) -> Result<PromptTemplate> {
    let t: PromptTemplate = serde_json::from_str(source).map_err(|e| EnrichError::InvalidTemplate {
        template_id: origin.to_string(),
        reason: e.to_string(),
    })?;
    if t.stage == TemplateStage::Prediction && t.task_type.is_none() {
        return Err(EnrichError::InvalidTemplate {
            template_id: t.template_id,
            reason: "prediction template without task_type".to_string(),
        });
    }
    Ok(t)
}

pub fn builtin_templates() -> Result<Vec<PromptTemplate>> {
    BUILTIN_SOURCES.iter().map(|(id, src)| parse_template(src, id)).collect()
}

/// Load every `*.json` template in a directory.
pub fn load_dir(dir: &Path) -> Result<Vec<PromptTemplate>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|p| {
            let src = std::fs::read_to_string(p)?;
            parse_template(&src, &p.display().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn template(user: &str, optional: &[&str]) -> PromptTemplate {
        PromptTemplate {
            template_id: "t".into(),
            version: "1".into(),
            description: String::new(),
            stage: TemplateStage::Prediction,
            task_type: Some(TaskType::BrainNutrients),
            system_prompt: "You estimate {{ data_type }}.".into(),
            user_prompt_template: user.into(),
            optional_slots: optional.iter().map(|s| s.to_string()).collect(),
            defaults: BTreeMap::from([("data_type".to_string(), json!("nutrients"))]),
            validation_criteria: vec![],
            known_answer_test: None,
        }
    }

    #[test]
    fn test_missing_slots_are_all_reported() {
        let store = TemplateStore::from_templates([template(
            "{{ food_name }} / {{ food_category }} / {{ context }}",
            &["context"],
        )])
        .unwrap();
        let err = store.render("t", &Slots::new()).unwrap_err();
        match err {
            EnrichError::MissingSlot { template_id, slots } => {
                assert_eq!(template_id, "t");
                assert_eq!(slots, vec!["food_category".to_string(), "food_name".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_conditional_section_follows_optional_slot() {
        let store = TemplateStore::from_templates([template(
            "Food: {{ food_name }}{% if context %} | Context: {{ context }}{% endif %}",
            &["context"],
        )])
        .unwrap();

        let without = store.render("t", &Slots::new().text("food_name", "Kale")).unwrap();
        assert_eq!(without.user, "Food: Kale");
        assert_eq!(without.system, "You estimate nutrients.");

        let with = store
            .render("t", &Slots::new().text("food_name", "Kale").text("context", "raw"))
            .unwrap();
        assert_eq!(with.user, "Food: Kale | Context: raw");
    }

    #[test]
    fn test_json_slot_is_deterministic() {
        let store = TemplateStore::from_templates([template("{{ data }}", &[])]).unwrap();
        let a = store.render("t", &Slots::new().json("data", json!({"b": 1, "a": {"d": 2, "c": 3}}))).unwrap();
        let b = store.render("t", &Slots::new().json("data", json!({"a": {"c": 3, "d": 2}, "b": 1}))).unwrap();
        assert_eq!(a, b);
        assert!(a.user.find("\"a\"").unwrap() < a.user.find("\"b\"").unwrap());
    }

    #[test]
    fn test_null_json_counts_as_absent() {
        let store = TemplateStore::from_templates([template(
            "x{% if extra %}{{ extra }}{% endif %}",
            &["extra"],
        )])
        .unwrap();
        let out = store.render("t", &Slots::new().json("extra", Value::Null)).unwrap();
        assert_eq!(out.user, "x");
    }

    #[test]
    fn test_builtin_set_is_complete() {
        let store = TemplateStore::builtin().unwrap();
        for task in TaskType::ALL {
            let t = store.for_task(task).unwrap();
            assert_eq!(t.stage, TemplateStage::Prediction);
            assert_eq!(t.task_type, Some(task));
        }
        let cal = store.get(CALIBRATION_TEMPLATE_ID).unwrap();
        assert_eq!(cal.stage, TemplateStage::Calibration);
        assert!(cal.known_answer_test.is_some());
    }

    #[test]
    fn test_builtin_prediction_renders_with_record_slots() {
        let store = TemplateStore::builtin().unwrap();
        let out = store
            .render(
                "mental_health_impacts",
                &Slots::new()
                    .text("food_name", "Salmon, wild")
                    .text("food_category", "Finfish")
                    .json("standard_nutrients_json", json!({"protein_g": 20.4})),
            )
            .unwrap();
        assert!(out.user.contains("up to 4 mental health impacts"));
        assert!(!out.user.contains("Brain nutrients per 100 g"));
    }

    #[test]
    fn test_override_dir_replaces_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = builtin_templates().unwrap().remove(0);
        t.version = "9.9.9".into();
        std::fs::write(
            dir.path().join("override.json"),
            serde_json::to_string(&t).unwrap(),
        )
        .unwrap();

        let store = TemplateStore::with_overrides(dir.path()).unwrap();
        assert_eq!(store.get(&t.template_id).unwrap().version, "9.9.9");
        assert_eq!(store.templates().count(), 5);
    }
}
