//! Known-answer regression tests for templates.
//!
//! A fixture pins the slot values of a template and the expected direction
//! of each confidence relative to a baseline. Directions, not values, are
//! compared since completions are not deterministic. Nothing is persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use nutripsych_common::{Direction, TaskType};
use nutripsych_llm::CompletionClient;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::calibrate::parse_calibration;
use crate::error::{EnrichError, Result};
use crate::schema::{confidence_index, RangeTable};
use crate::settings::ModelSettings;
use crate::template::{PromptTemplate, Slots, TemplateStage, TemplateStore};
use crate::validate::parse_and_validate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyOutcome {
    pub key: String,
    pub expected: Direction,
    pub observed: Option<Direction>,
    pub baseline: Option<f64>,
    pub output: Option<f64>,
    pub passed: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub template_id: String,
    pub version: String,
    pub passed: bool,
    pub outcomes: Vec<KeyOutcome>,
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        writeln!(f, "{} v{}: {verdict}", self.template_id, self.version)?;
        for o in &self.outcomes {
            let fmt_num = |v: Option<f64>| v.map_or("-".to_string(), |n| n.to_string());
            write!(
                f,
                "  [{}] {}: expected {}, observed {} ({} -> {})",
                if o.passed { "ok" } else { "x" },
                o.key,
                o.expected.as_str(),
                o.observed.map_or("-", |d| d.as_str()),
                fmt_num(o.baseline),
                fmt_num(o.output),
            )?;
            if let Some(note) = &o.note {
                write!(f, " {note}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Look a fixture key up in a confidence index: exact path first, then a
/// unique match on the last path segment.
pub fn lookup_confidence(index: &BTreeMap<String, f64>, key: &str) -> Option<f64> {
    if let Some(v) = index.get(key) {
        return Some(*v);
    }
    let mut matches = index
        .iter()
        .filter(|(path, _)| path.rsplit('.').next() == Some(key))
        .map(|(_, v)| *v);
    let first = matches.next()?;
    matches.next().is_none().then_some(first)
}

pub struct KnownAnswerRunner {
    templates: Arc<TemplateStore>,
    client: Arc<CompletionClient>,
    ranges: Arc<RangeTable>,
    settings: ModelSettings,
}

impl KnownAnswerRunner {
    pub fn new(
        templates: Arc<TemplateStore>,
        client: Arc<CompletionClient>,
        ranges: Arc<RangeTable>,
        settings: ModelSettings,
    ) -> Self {
        Self { templates, client, ranges, settings }
    }

    /// Run the fixture of every template that has one.
    pub async fn run_all(&self) -> Vec<(String, Result<TestReport>)> {
        let mut out = Vec::new();
        for t in self.templates.templates().filter(|t| t.known_answer_test.is_some()) {
            out.push((t.template_id.clone(), self.run_known_answer_tests(t).await));
        }
        out
    }

    #[instrument(skip(self, template), fields(template_id = %template.template_id, version = %template.version))]
    pub async fn run_known_answer_tests(&self, template: &PromptTemplate) -> Result<TestReport> {
        let fixture = template.known_answer_test.as_ref().ok_or_else(|| EnrichError::NoFixture {
            template_id: template.template_id.clone(),
        })?;
        let params = &fixture.input_parameters;
        let generated = params.get("generated_data_json");

        let prompt = self.templates.render(&template.template_id, &Slots::from_parameters(params))?;
        let label = match template.stage {
            TemplateStage::Calibration => template.template_id.clone(),
            TemplateStage::Prediction => template
                .task_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| template.template_id.clone()),
        };
        let raw = self
            .client
            .complete(&prompt.system, &prompt.user, &self.settings.options_for(&label))
            .await?;

        let output = match template.stage {
            TemplateStage::Prediction => {
                let task = template.task_type.ok_or_else(|| invalid(template, "prediction template without task_type"))?;
                parse_and_validate(&raw, task, &self.ranges)?.payload
            }
            TemplateStage::Calibration => {
                let task: TaskType = params
                    .get("data_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(template, "fixture lacks data_type"))?
                    .parse()
                    .map_err(|e: nutripsych_common::task::ParseTaskTypeError| invalid(template, &e.to_string()))?;
                let input = generated.ok_or_else(|| invalid(template, "fixture lacks generated_data_json"))?;
                parse_calibration(&raw, task, input, &self.ranges)?.payload
            }
        };

        let baseline: BTreeMap<String, f64> = match &fixture.baseline {
            Some(b) => b.clone(),
            None => generated.map(confidence_index).unwrap_or_default(),
        };
        let observed = confidence_index(&output);

        let outcomes: Vec<KeyOutcome> = fixture
            .expected_outputs
            .iter()
            .map(|(key, expected)| compare(key, *expected, &baseline, &observed))
            .collect();
        let passed = outcomes.iter().all(|o| o.passed);

        if passed {
            info!(keys = outcomes.len(), "Known-answer test passed");
        } else {
            warn!(
                failed = ?outcomes.iter().filter(|o| !o.passed).map(|o| &o.key).collect::<Vec<_>>(),
                "Known-answer test failed"
            );
        }

        Ok(TestReport {
            template_id: template.template_id.clone(),
            version: template.version.clone(),
            passed,
            outcomes,
        })
    }
}

fn invalid(template: &PromptTemplate, reason: &str) -> EnrichError {
    EnrichError::InvalidTemplate {
        template_id: template.template_id.clone(),
        reason: reason.to_string(),
    }
}

fn compare(
    key: &str,
    expected: Direction,
    baseline: &BTreeMap<String, f64>,
    observed: &BTreeMap<String, f64>,
) -> KeyOutcome {
    let base = lookup_confidence(baseline, key);
    let out = lookup_confidence(observed, key);
    let (direction, note) = match (base, out) {
        (Some(b), Some(o)) => (Some(Direction::between(b, o)), None),
        (None, _) => (None, Some("no baseline value".to_string())),
        (_, None) => (None, Some("missing from output".to_string())),
    };
    KeyOutcome {
        key: key.to_string(),
        expected,
        observed: direction,
        baseline: base,
        output: out,
        passed: direction == Some(expected),
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_unique_leaf() {
        let index = BTreeMap::from([
            ("omega3.dha_mg_confidence".to_string(), 6.0),
            ("tryptophan_mg_confidence".to_string(), 7.0),
        ]);
        assert_eq!(lookup_confidence(&index, "dha_mg_confidence"), Some(6.0));
        assert_eq!(lookup_confidence(&index, "tryptophan_mg_confidence"), Some(7.0));
        assert_eq!(lookup_confidence(&index, "epa_mg_confidence"), None);
    }

    #[test]
    fn test_ambiguous_leaf_does_not_match() {
        let index = BTreeMap::from([
            ("impacts[0].confidence".to_string(), 6.0),
            ("impacts[1].confidence".to_string(), 5.0),
        ]);
        assert_eq!(lookup_confidence(&index, "confidence"), None);
        assert_eq!(lookup_confidence(&index, "impacts[1].confidence"), Some(5.0));
    }

    #[test]
    fn test_compare_uses_tolerance() {
        let baseline = BTreeMap::from([("a_confidence".to_string(), 5.0)]);
        let observed = BTreeMap::from([("a_confidence".to_string(), 5.4)]);
        let o = compare("a_confidence", Direction::Maintain, &baseline, &observed);
        assert!(o.passed);
        let o = compare("a_confidence", Direction::Increase, &baseline, &observed);
        assert!(!o.passed);
        assert_eq!(o.observed, Some(Direction::Maintain));
    }
}
