//! Confidence calibration: a second completion pass that revises the
//! confidence scores of a validated result.
//!
//! The calibrated payload must mirror the input exactly (same keys, same
//! nesting, same list lengths) plus a `calibration_notes` list. After
//! parsing, the citation rule is enforced locally: a claim scored 8 or
//! above without citations is capped to 7 and a note is appended.

use std::collections::BTreeSet;
use std::sync::Arc;

use nutripsych_common::confidence::cap_uncited;
use nutripsych_common::TaskType;
use nutripsych_llm::{CompletionClient, CompletionOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::error::{EnrichError, Result};
use crate::schema::{field_set, join, RangeTable};
use crate::template::{Slots, TemplateStore, CALIBRATION_TEMPLATE_ID};
use crate::validate::{extract_json_object, validate_payload, EnrichmentResult, RangeViolation};

pub const NOTES_FIELD: &str = "calibration_notes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationCap {
    pub path: String,
    pub original: f64,
    pub capped: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub task_type: TaskType,
    pub payload: Value,
    /// Model notes first, then one note per local repair.
    pub calibration_notes: Vec<String>,
    pub range_violations: Vec<RangeViolation>,
    pub caps_applied: Vec<CitationCap>,
}

impl CalibrationResult {
    /// Field paths of the payload plus `calibration_notes`.
    pub fn field_set(&self) -> BTreeSet<String> {
        let mut fields = field_set(&self.payload);
        fields.insert(NOTES_FIELD.to_string());
        fields
    }
}

// ── Calibrator ────────────────────────────────────────────────────────────────

pub struct Calibrator {
    templates: Arc<TemplateStore>,
    client: Arc<CompletionClient>,
    ranges: Arc<RangeTable>,
    options: CompletionOptions,
    template_id: String,
}

impl Calibrator {
    pub fn new(
        templates: Arc<TemplateStore>,
        client: Arc<CompletionClient>,
        ranges: Arc<RangeTable>,
        options: CompletionOptions,
    ) -> Self {
        Self {
            templates,
            client,
            ranges,
            options,
            template_id: CALIBRATION_TEMPLATE_ID.to_string(),
        }
    }

    #[instrument(skip(self, result, reference_data), fields(task = %data_type))]
    pub async fn calibrate(
        &self,
        result: &EnrichmentResult,
        food_name: &str,
        data_type: TaskType,
        reference_data: Option<&Value>,
    ) -> Result<CalibrationResult> {
        let violations = if result.range_violations.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&result.range_violations)?)
        };
        let slots = Slots::new()
            .text("food_name", food_name)
            .text("data_type", data_type.as_str())
            .json("generated_data_json", result.payload.clone())
            .maybe_json("reference_data_json", reference_data.cloned())
            .maybe_json("range_violations_json", violations);
        let prompt = self.templates.render(&self.template_id, &slots)?;
        let raw = self.client.complete(&prompt.system, &prompt.user, &self.options).await?;

        let calibrated = parse_calibration(&raw, data_type, &result.payload, &self.ranges)?;
        info!(
            food = food_name,
            notes = calibrated.calibration_notes.len(),
            caps = calibrated.caps_applied.len(),
            "Calibration complete"
        );
        Ok(calibrated)
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse a calibration response against the payload it was asked to revise.
pub fn parse_calibration(
    raw: &str,
    task: TaskType,
    input: &Value,
    ranges: &RangeTable,
) -> Result<CalibrationResult> {
    let mut obj = extract_json_object(raw)?;
    let mut diff = ShapeDiff::default();

    let mut notes = match obj.remove(NOTES_FIELD) {
        None | Some(Value::Null) => {
            diff.missing.push(NOTES_FIELD.to_string());
            Vec::new()
        }
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => {
            let notes: Vec<String> = items.iter().filter_map(|n| n.as_str().map(str::to_string)).collect();
            if notes.len() != items.len() {
                diff.mistyped.push(NOTES_FIELD.to_string());
            }
            notes
        }
        Some(_) => {
            diff.mistyped.push(NOTES_FIELD.to_string());
            Vec::new()
        }
    };
    obj.remove("reasoning");

    let output = Value::Object(obj);
    diff.compare(input, &output, "");
    if !diff.is_empty() {
        warn!(task = %task, missing = ?diff.missing, extraneous = ?diff.extraneous, mistyped = ?diff.mistyped,
            "Calibration output diverges from input");
        return Err(diff.into_error());
    }

    let Value::Object(obj) = output else {
        return Err(EnrichError::MalformedResponse("calibration output is not an object".into()));
    };
    let validated = validate_payload(obj, task, ranges).map_err(|e| match e {
        EnrichError::SchemaMismatch { missing, extraneous, mistyped } => {
            EnrichError::CalibrationShape { missing, extraneous, mistyped }
        }
        other => other,
    })?;

    let mut payload = validated.payload;
    let caps = enforce_citation_rule(&mut payload);
    for cap in &caps {
        notes.push(format!(
            "{}: confidence {} capped to {} because the claim has no citations",
            cap.path, cap.original, cap.capped
        ));
    }

    Ok(CalibrationResult {
        task_type: task,
        payload,
        calibration_notes: notes,
        range_violations: validated.range_violations,
        caps_applied: caps,
    })
}

#[derive(Debug, Default)]
struct ShapeDiff {
    missing: Vec<String>,
    extraneous: Vec<String>,
    mistyped: Vec<String>,
}

impl ShapeDiff {
    fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extraneous.is_empty() && self.mistyped.is_empty()
    }

    fn into_error(self) -> EnrichError {
        EnrichError::CalibrationShape {
            missing: self.missing,
            extraneous: self.extraneous,
            mistyped: self.mistyped,
        }
    }

    /// Scalars are interchangeable here; their types are checked against the
    /// field table afterwards.
    fn compare(&mut self, expected: &Value, actual: &Value, path: &str) {
        match (expected, actual) {
            (Value::Object(e), Value::Object(a)) => {
                for key in e.keys().filter(|k| !a.contains_key(*k)) {
                    self.missing.push(join(path, key));
                }
                for key in a.keys().filter(|k| !e.contains_key(*k)) {
                    self.extraneous.push(join(path, key));
                }
                for (key, ev) in e {
                    if let Some(av) = a.get(key) {
                        self.compare(ev, av, &join(path, key));
                    }
                }
            }
            (Value::Array(e), Value::Array(a)) => {
                if e.len() != a.len() {
                    self.mistyped.push(format!("{path} (length {} vs {})", e.len(), a.len()));
                    return;
                }
                for (i, (ev, av)) in e.iter().zip(a).enumerate() {
                    self.compare(ev, av, &format!("{path}[{i}]"));
                }
            }
            (Value::Object(_) | Value::Array(_), _) => self.mistyped.push(path.to_string()),
            // A null group (e.g. unknown omega3) may stay null or be filled in.
            (Value::Null, Value::Object(_) | Value::Array(_)) => {}
            (_, Value::Object(_) | Value::Array(_)) => self.mistyped.push(path.to_string()),
            _ => {}
        }
    }
}

/// Cap every claim (an object with a numeric `confidence`) that sits in the
/// cited band without citations.
pub fn enforce_citation_rule(payload: &mut Value) -> Vec<CitationCap> {
    fn walk(value: &mut Value, path: &str, caps: &mut Vec<CitationCap>) {
        match value {
            Value::Object(map) => {
                cap_claim(map, path, caps);
                for (k, v) in map.iter_mut() {
                    walk(v, &join(path, k), caps);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    walk(item, &format!("{path}[{i}]"), caps);
                }
            }
            _ => {}
        }
    }

    fn cap_claim(map: &mut Map<String, Value>, path: &str, caps: &mut Vec<CitationCap>) {
        let Some(confidence) = map.get("confidence").and_then(Value::as_f64) else {
            return;
        };
        let cited = map.get("citations").and_then(Value::as_array).map_or(0, |c| c.len());
        if let Some(capped) = cap_uncited(confidence, cited) {
            map.insert("confidence".to_string(), Value::from(capped));
            caps.push(CitationCap { path: path.to_string(), original: confidence, capped });
        }
    }

    let mut caps = Vec::new();
    walk(payload, "", &mut caps);
    caps
}
