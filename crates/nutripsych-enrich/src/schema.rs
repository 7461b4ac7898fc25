//! Expected-field tables per task type, the numeric range table, and
//! helpers for walking JSON payloads.
//!
//! Model output is untrusted. Every payload is checked against an explicit
//! table here rather than against whatever shape the typed record structs
//! happen to accept.

use std::collections::{BTreeMap, BTreeSet};

use nutripsych_common::confidence::{CONFIDENCE_MAX, CONFIDENCE_MIN};
use nutripsych_common::TaskType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Field tables ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Non-negative quantity with a default upper bound.
    Amount { max: f64 },
    /// Confidence score, always [1, 10].
    Confidence,
    /// Other 1–10 score (impact strength).
    Score,
    Text,
    TextList,
    Enum(&'static [&'static str]),
    Object(&'static [FieldSpec]),
    ObjectList(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub nullable: bool,
}

const fn amount(name: &'static str, max: f64) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::Amount { max }, required: true, nullable: true }
}

const fn amount_confidence(name: &'static str) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::Confidence, required: true, nullable: true }
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: true, nullable: false }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: false, nullable: true }
}

pub const OMEGA3_FIELDS: &[FieldSpec] = &[
    amount("total_g", 60.0),
    amount_confidence("total_g_confidence"),
    amount("epa_mg", 20_000.0),
    amount_confidence("epa_mg_confidence"),
    amount("dha_mg", 30_000.0),
    amount_confidence("dha_mg_confidence"),
    amount("ala_mg", 60_000.0),
    amount_confidence("ala_mg_confidence"),
];

pub const BRAIN_NUTRIENT_FIELDS: &[FieldSpec] = &[
    amount("tryptophan_mg", 1_500.0),
    amount_confidence("tryptophan_mg_confidence"),
    amount("tyrosine_mg", 3_000.0),
    amount_confidence("tyrosine_mg_confidence"),
    amount("vitamin_b6_mg", 10.0),
    amount_confidence("vitamin_b6_mg_confidence"),
    amount("folate_mcg", 3_000.0),
    amount_confidence("folate_mcg_confidence"),
    amount("vitamin_b12_mcg", 100.0),
    amount_confidence("vitamin_b12_mcg_confidence"),
    amount("vitamin_d_mcg", 100.0),
    amount_confidence("vitamin_d_mcg_confidence"),
    amount("magnesium_mg", 1_000.0),
    amount_confidence("magnesium_mg_confidence"),
    amount("zinc_mg", 100.0),
    amount_confidence("zinc_mg_confidence"),
    amount("iron_mg", 100.0),
    amount_confidence("iron_mg_confidence"),
    amount("selenium_mcg", 2_000.0),
    amount_confidence("selenium_mcg_confidence"),
    amount("choline_mg", 1_000.0),
    amount_confidence("choline_mg_confidence"),
    FieldSpec { name: "omega3", kind: FieldKind::Object(OMEGA3_FIELDS), required: true, nullable: true },
];

pub const BIOACTIVE_FIELDS: &[FieldSpec] = &[
    amount("polyphenols_mg", 20_000.0),
    amount_confidence("polyphenols_mg_confidence"),
    amount("flavonoids_mg", 10_000.0),
    amount_confidence("flavonoids_mg_confidence"),
    amount("anthocyanins_mg", 5_000.0),
    amount_confidence("anthocyanins_mg_confidence"),
    amount("carotenoids_mg", 1_000.0),
    amount_confidence("carotenoids_mg_confidence"),
    amount("probiotics_cfu", 1e12),
    amount_confidence("probiotics_cfu_confidence"),
    amount("prebiotic_fiber_g", 100.0),
    amount_confidence("prebiotic_fiber_g_confidence"),
];

pub const IMPACT_DIRECTIONS: &[&str] = &["positive", "negative", "neutral", "mixed"];
pub const INTERACTION_TYPES: &[&str] = &["synergistic", "antagonistic", "competitive", "cofactor"];

pub const IMPACT_FIELDS: &[FieldSpec] = &[
    required("impact_type", FieldKind::Text),
    required("direction", FieldKind::Enum(IMPACT_DIRECTIONS)),
    required("mechanism", FieldKind::Text),
    required("strength", FieldKind::Score),
    required("confidence", FieldKind::Confidence),
    optional("time_to_effect", FieldKind::Text),
    optional("research_context", FieldKind::Text),
    FieldSpec { name: "citations", kind: FieldKind::TextList, required: false, nullable: false },
];

pub const INTERACTION_FIELDS: &[FieldSpec] = &[
    required("nutrients", FieldKind::TextList),
    required("interaction_type", FieldKind::Enum(INTERACTION_TYPES)),
    required("pathway", FieldKind::Text),
    required("mechanism", FieldKind::Text),
    optional("mental_health_relevance", FieldKind::Text),
    required("confidence", FieldKind::Confidence),
    FieldSpec { name: "citations", kind: FieldKind::TextList, required: false, nullable: false },
];

pub const IMPACTS_PAYLOAD: &[FieldSpec] = &[required("impacts", FieldKind::ObjectList(IMPACT_FIELDS))];

pub const INTERACTIONS_PAYLOAD: &[FieldSpec] =
    &[required("interactions", FieldKind::ObjectList(INTERACTION_FIELDS))];

/// Top-level field table for a task's payload. `reasoning` is accepted on
/// every payload in addition to these fields.
pub fn fields_for(task: TaskType) -> &'static [FieldSpec] {
    match task {
        TaskType::BrainNutrients       => BRAIN_NUTRIENT_FIELDS,
        TaskType::BioactiveCompounds   => BIOACTIVE_FIELDS,
        TaskType::MentalHealthImpacts  => IMPACTS_PAYLOAD,
        TaskType::NutrientInteractions => INTERACTIONS_PAYLOAD,
    }
}

// ── Range table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

impl NumericRange {
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }
}

const SCORE_RANGE: NumericRange = NumericRange { min: CONFIDENCE_MIN, max: CONFIDENCE_MAX };

/// Plausible numeric ranges. Amount bounds default to `[0, max]` from the
/// field table and can be overridden per dotted path (`omega3.dha_mg`) or per
/// field name (`dha_mg`); the path wins. Confidence and strength are fixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeTable {
    overrides: BTreeMap<String, NumericRange>,
}

impl RangeTable {
    pub fn new(overrides: BTreeMap<String, NumericRange>) -> Self {
        Self { overrides }
    }

    /// `path` is the dotted field path without list indices.
    pub fn range_for(&self, path: &str, spec: &FieldSpec) -> Option<NumericRange> {
        match spec.kind {
            FieldKind::Confidence | FieldKind::Score => Some(SCORE_RANGE),
            FieldKind::Amount { max } => Some(
                self.overrides
                    .get(path)
                    .or_else(|| self.overrides.get(spec.name))
                    .copied()
                    .unwrap_or(NumericRange { min: 0.0, max }),
            ),
            _ => None,
        }
    }
}

// ── Payload walking ───────────────────────────────────────────────────────────

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") }
}

/// Every field path in a payload, list elements collapsed to `[]`.
pub fn field_set(value: &Value) -> BTreeSet<String> {
    fn walk(value: &Value, prefix: &str, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let path = join(prefix, k);
                    out.insert(path.clone());
                    walk(v, &path, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, &format!("{prefix}[]"), out);
                }
            }
            _ => {}
        }
    }
    let mut out = BTreeSet::new();
    walk(value, "", &mut out);
    out
}

fn is_confidence_key(key: &str) -> bool {
    key == "confidence" || key.ends_with("_confidence")
}

/// Flattened numeric confidences keyed by path (`omega3.dha_mg_confidence`,
/// `impacts[0].confidence`). Null confidences are skipped.
pub fn confidence_index(value: &Value) -> BTreeMap<String, f64> {
    fn walk(value: &Value, prefix: &str, out: &mut BTreeMap<String, f64>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let path = join(prefix, k);
                    match v.as_f64() {
                        Some(n) if is_confidence_key(k) => {
                            out.insert(path, n);
                        }
                        _ => walk(v, &path, out),
                    }
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, &format!("{prefix}[{i}]"), out);
                }
            }
            _ => {}
        }
    }
    let mut out = BTreeMap::new();
    walk(value, "", &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_every_amount_has_a_confidence_sibling() {
        for table in [BRAIN_NUTRIENT_FIELDS, BIOACTIVE_FIELDS, OMEGA3_FIELDS] {
            for spec in table.iter().filter(|s| matches!(s.kind, FieldKind::Amount { .. })) {
                let sibling = format!("{}_confidence", spec.name);
                assert!(table.iter().any(|s| s.name == sibling), "{} lacks {sibling}", spec.name);
            }
        }
    }

    #[test]
    fn test_range_override_precedence() {
        let dha = OMEGA3_FIELDS.iter().find(|s| s.name == "dha_mg").unwrap();
        let table = RangeTable::new(BTreeMap::from([
            ("dha_mg".to_string(), NumericRange { min: 0.0, max: 5_000.0 }),
            ("omega3.dha_mg".to_string(), NumericRange { min: 0.0, max: 4_000.0 }),
        ]));
        assert_eq!(table.range_for("omega3.dha_mg", dha).unwrap().max, 4_000.0);
        assert_eq!(table.range_for("other.dha_mg", dha).unwrap().max, 5_000.0);
        assert_eq!(RangeTable::default().range_for("omega3.dha_mg", dha).unwrap().max, 30_000.0);
    }

    #[test]
    fn test_confidence_range_cannot_be_overridden() {
        let spec = amount_confidence("tryptophan_mg_confidence");
        let table = RangeTable::new(BTreeMap::from([(
            "tryptophan_mg_confidence".to_string(),
            NumericRange { min: 0.0, max: 100.0 },
        )]));
        assert_eq!(table.range_for("tryptophan_mg_confidence", &spec), Some(SCORE_RANGE));
    }

    #[test]
    fn test_confidence_index_paths() {
        let payload = json!({
            "tryptophan_mg": 260, "tryptophan_mg_confidence": 7,
            "folate_mcg": null, "folate_mcg_confidence": null,
            "omega3": { "dha_mg": 1100, "dha_mg_confidence": 6 },
            "impacts": [{ "confidence": 8, "citations": [] }]
        });
        let index = confidence_index(&payload);
        assert_eq!(
            index.into_iter().collect::<Vec<_>>(),
            vec![
                ("impacts[0].confidence".to_string(), 8.0),
                ("omega3.dha_mg_confidence".to_string(), 6.0),
                ("tryptophan_mg_confidence".to_string(), 7.0),
            ]
        );
    }

    #[test]
    fn test_field_set_collapses_list_indices() {
        let payload = json!({ "impacts": [{ "confidence": 8 }, { "confidence": 5 }] });
        let fields: Vec<_> = field_set(&payload).into_iter().collect();
        assert_eq!(fields, vec!["impacts", "impacts[].confidence"]);
    }
}
