//! Known-answer tests of the built-in calibration template.

use std::sync::Arc;
use std::time::Duration;

use nutripsych_common::Direction;
use nutripsych_enrich::{
    EnrichError, KnownAnswerRunner, ModelSettings, RangeTable, TemplateStore, CALIBRATION_TEMPLATE_ID,
};
use nutripsych_llm::mock::MockBackend;
use nutripsych_llm::{CompletionClient, LlmError, LlmRequest, RetryPolicy};
use nutripsych_test_utils::calibration_reply;
use serde_json::{json, Value};

fn runner(backend: MockBackend) -> (KnownAnswerRunner, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let policy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
    };
    let runner = KnownAnswerRunner::new(
        TemplateStore::builtin().unwrap(),
        Arc::new(CompletionClient::new(backend.clone(), policy)),
        Arc::new(RangeTable::default()),
        ModelSettings::default(),
    );
    (runner, backend)
}

fn adjusting(adjust: fn(&mut Value)) -> MockBackend {
    MockBackend::new("mock").with_responder(move |req: &LlmRequest| {
        calibration_reply(req.user_prompt(), &["compared against USDA reference"], adjust)
            .ok_or_else(|| LlmError::Unavailable("no generated data in prompt".into()))
    })
}

#[tokio::test]
async fn test_salmon_fixture_passes_with_expected_directions() {
    let (runner, backend) = runner(adjusting(|data| {
        data["vitamin_d_mcg_confidence"] = json!(8);
        data["omega3"]["dha_mg_confidence"] = json!(8);
    }));
    let templates = TemplateStore::builtin().unwrap();
    let template = templates.get(CALIBRATION_TEMPLATE_ID).unwrap();

    let report = runner.run_known_answer_tests(template).await.unwrap();

    assert!(report.passed, "{report}");
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(backend.call_count(), 1);
    let prompt = backend.requests()[0].user_prompt().to_string();
    assert!(prompt.contains("Salmon, wild"));
    assert!(prompt.contains("Reference data"));
}

#[tokio::test]
async fn test_wrong_direction_fails_and_names_the_key() {
    let (runner, _) = runner(adjusting(|data| {
        data["vitamin_d_mcg_confidence"] = json!(3);
        data["omega3"]["dha_mg_confidence"] = json!(8);
    }));
    let templates = TemplateStore::builtin().unwrap();

    let report = runner
        .run_known_answer_tests(templates.get(CALIBRATION_TEMPLATE_ID).unwrap())
        .await
        .unwrap();

    assert!(!report.passed);
    let failed: Vec<_> = report.outcomes.iter().filter(|o| !o.passed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, "vitamin_d_mcg_confidence");
    assert_eq!(failed[0].observed, Some(Direction::Decrease));
    assert!(report.to_string().contains("FAIL"));
}

#[tokio::test]
async fn test_unchanged_output_fails_expected_increases() {
    let (runner, _) = runner(adjusting(|_| {}));

    let results = runner.run_all().await;

    assert_eq!(results.len(), 1);
    let (id, report) = &results[0];
    assert_eq!(id, CALIBRATION_TEMPLATE_ID);
    let report = report.as_ref().unwrap();
    assert!(!report.passed);
    assert_eq!(report.outcomes.iter().filter(|o| o.passed).count(), 1);
}

#[tokio::test]
async fn test_template_without_fixture_is_an_error() {
    let (runner, backend) = runner(MockBackend::new("mock"));
    let templates = TemplateStore::builtin().unwrap();

    let err = runner
        .run_known_answer_tests(templates.get("brain_nutrient_prediction").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, EnrichError::NoFixture { .. }));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_malformed_reply_is_an_error_not_a_failed_report() {
    let (runner, _) = runner(MockBackend::new("mock").with_response("I could not review this data."));
    let templates = TemplateStore::builtin().unwrap();

    let err = runner
        .run_known_answer_tests(templates.get(CALIBRATION_TEMPLATE_ID).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, EnrichError::MalformedResponse(_)));
}
