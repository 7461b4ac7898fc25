//! Response parsing and validation.
//!
//! Raw completion text -> first JSON object -> shape check against the
//! task's field table -> range check with clamping. Shape problems fail the
//! task; out-of-range numbers are repaired and reported.

use nutripsych_common::TaskType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{EnrichError, Result};
use crate::schema::{fields_for, join, FieldKind, FieldSpec, RangeTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeViolation {
    pub path: String,
    pub original: f64,
    pub clamped: f64,
}

/// Validated output of one prediction task.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentResult {
    pub task_type: TaskType,
    /// Payload matching the task's field table, `reasoning` removed.
    pub payload: Value,
    pub range_violations: Vec<RangeViolation>,
    pub reasoning: Option<String>,
}

/// First complete JSON object in `raw`. Surrounding prose and code fences
/// are ignored.
pub fn extract_json_object(raw: &str) -> Result<Map<String, Value>> {
    for (start, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Ok(map);
        }
    }
    Err(EnrichError::MalformedResponse(format!(
        "no JSON object found in {} characters of output",
        raw.len()
    )))
}

/// Parse a prediction response for `task`.
pub fn parse_and_validate(raw: &str, task: TaskType, ranges: &RangeTable) -> Result<EnrichmentResult> {
    let obj = extract_json_object(raw)?;
    let result = validate_payload(obj, task, ranges)?;
    debug!(
        task = %task,
        violations = result.range_violations.len(),
        "Response validated"
    );
    Ok(result)
}

/// Shape and range check of an already-extracted object.
pub fn validate_payload(
    mut obj: Map<String, Value>,
    task: TaskType,
    ranges: &RangeTable,
) -> Result<EnrichmentResult> {
    let reasoning = match obj.remove("reasoning") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    let mut checker = Checker::new(ranges);
    checker.check_object(&mut obj, fields_for(task), "", "");

    if !checker.missing.is_empty() || !checker.extraneous.is_empty() || !checker.mistyped.is_empty() {
        warn!(
            task = %task,
            missing = ?checker.missing,
            extraneous = ?checker.extraneous,
            mistyped = ?checker.mistyped,
            "Schema mismatch"
        );
        return Err(EnrichError::SchemaMismatch {
            missing: checker.missing,
            extraneous: checker.extraneous,
            mistyped: checker.mistyped,
        });
    }

    for v in &checker.violations {
        debug!(task = %task, path = %v.path, original = v.original, clamped = v.clamped, "Value clamped");
    }

    Ok(EnrichmentResult {
        task_type: task,
        payload: Value::Object(obj),
        range_violations: checker.violations,
        reasoning,
    })
}

struct Checker<'a> {
    ranges: &'a RangeTable,
    missing: Vec<String>,
    extraneous: Vec<String>,
    mistyped: Vec<String>,
    violations: Vec<RangeViolation>,
}

impl<'a> Checker<'a> {
    fn new(ranges: &'a RangeTable) -> Self {
        Self {
            ranges,
            missing: Vec::new(),
            extraneous: Vec::new(),
            mistyped: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// `path` carries list indices for reporting; `range_path` omits them
    /// for range lookups.
    fn check_object(
        &mut self,
        obj: &mut Map<String, Value>,
        fields: &[FieldSpec],
        path: &str,
        range_path: &str,
    ) {
        for key in obj.keys() {
            if !fields.iter().any(|f| f.name == key) {
                self.extraneous.push(join(path, key));
            }
        }
        for spec in fields {
            let field_path = join(path, spec.name);
            match obj.get_mut(spec.name) {
                None if spec.required => self.missing.push(field_path),
                None => {}
                Some(Value::Null) if spec.nullable => {}
                Some(Value::Null) => self.mistyped.push(field_path),
                Some(v) => self.check_value(v, spec, field_path, join(range_path, spec.name)),
            }
        }
    }

    fn check_value(&mut self, v: &mut Value, spec: &FieldSpec, path: String, range_path: String) {
        match spec.kind {
            FieldKind::Amount { .. } | FieldKind::Confidence | FieldKind::Score => {
                let Some(n) = v.as_f64() else {
                    self.mistyped.push(path);
                    return;
                };
                if let Some(range) = self.ranges.range_for(&range_path, spec) {
                    if !range.contains(n) {
                        let clamped = range.clamp(n);
                        *v = Value::from(clamped);
                        self.violations.push(RangeViolation { path, original: n, clamped });
                    }
                }
            }
            FieldKind::Text => {
                if !v.is_string() {
                    self.mistyped.push(path);
                }
            }
            FieldKind::TextList => {
                let ok = v.as_array().is_some_and(|items| items.iter().all(Value::is_string));
                if !ok {
                    self.mistyped.push(path);
                }
            }
            FieldKind::Enum(allowed) => {
                let normalized = v.as_str().map(|s| s.trim().to_lowercase());
                match normalized {
                    Some(s) if allowed.contains(&s.as_str()) => *v = Value::String(s),
                    _ => self.mistyped.push(path),
                }
            }
            FieldKind::Object(fields) => match v.as_object_mut() {
                Some(obj) => self.check_object(obj, fields, &path, &range_path),
                None => self.mistyped.push(path),
            },
            FieldKind::ObjectList(fields) => match v.as_array_mut() {
                Some(items) => {
                    for (i, item) in items.iter_mut().enumerate() {
                        let item_path = format!("{path}[{i}]");
                        match item.as_object_mut() {
                            Some(obj) => self.check_object(obj, fields, &item_path, &range_path),
                            None => self.mistyped.push(item_path),
                        }
                    }
                }
                None => self.mistyped.push(path),
            },
        }
    }
}
