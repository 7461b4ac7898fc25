//! End-to-end runs of the orchestrator against the mock backend and the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nutripsych_common::{FoodRecord, MergedEnrichment, TaskType};
use nutripsych_db::{FoodFilter, FoodStore, MemoryFoodStore};
use nutripsych_enrich::{
    EnrichError, ModelSettings, Orchestrator, PipelineConfig, RangeTable, RecordStatus, TaskState, TemplateStore,
};
use nutripsych_llm::mock::MockBackend;
use nutripsych_llm::{CompletionClient, LlmError, LlmRequest, RetryPolicy};
use nutripsych_test_utils::{
    calibration_reply, pipeline_backend, pipeline_reply, prompt_kind, salmon_record, spinach_record,
    walnut_record,
};
use serde_json::json;
use tokio::sync::watch;

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    backend: Arc<MockBackend>,
    store: Arc<MemoryFoodStore>,
    shutdown: watch::Sender<bool>,
}

fn harness(backend: MockBackend, config: PipelineConfig) -> Harness {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryFoodStore::with_records([salmon_record(), spinach_record()]));
    let (shutdown, rx) = watch::channel(false);
    let client = Arc::new(CompletionClient::new(backend.clone(), no_retry()).with_shutdown(rx.clone()));
    let orchestrator = Orchestrator::new(
        TemplateStore::builtin().unwrap(),
        client,
        store.clone(),
        Arc::new(RangeTable::default()),
        ModelSettings::default(),
        config,
        rx,
    );
    Harness { orchestrator, backend, store, shutdown }
}

#[tokio::test]
async fn test_all_tasks_succeed_and_commit_once() {
    let h = harness(pipeline_backend(), PipelineConfig::default());

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();
    let outcome = summary.record("salmon_wild").unwrap();

    assert_eq!(outcome.status, RecordStatus::Committed { version: 1 });
    assert!(outcome.retained.is_none());
    assert!(outcome.tasks.iter().all(|t| t.state == TaskState::Committed));
    assert_eq!(h.store.commit_count(), 1);
    // One prediction and one calibration per task type.
    assert_eq!(h.backend.call_count(), 8);

    let record = h.store.get("salmon_wild").await.unwrap();
    for task in TaskType::ALL {
        assert!(record.has_enrichment(task), "{task} missing");
    }
    assert_eq!(record.metadata.version, 1);
    assert_eq!(record.mental_health_impacts.len(), 2);
    assert!(record.data_quality.last_calibrated.is_some());
    assert_eq!(record.data_quality.calibration_notes.len(), 4);
}

#[tokio::test]
async fn test_one_failed_task_blocks_the_whole_commit() {
    let backend = MockBackend::new("mock").with_responder(|req: &LlmRequest| {
        if prompt_kind(req.user_prompt()) == Some("mental_health_impacts") {
            return Ok(json!({ "impacts": [{ "impact_type": "mood", "mood_score": 4 }] }).to_string());
        }
        pipeline_reply(req)
    });
    let h = harness(backend, PipelineConfig::default());
    let before = h.store.get("salmon_wild").await.unwrap();

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();
    let outcome = summary.record("salmon_wild").unwrap();

    assert_eq!(outcome.status, RecordStatus::Incomplete);
    assert_eq!(h.store.commit_count(), 0);
    assert_eq!(h.store.get("salmon_wild").await.unwrap(), before);

    let impacts = outcome.task(TaskType::MentalHealthImpacts).unwrap();
    match &impacts.state {
        TaskState::Failed(reason) => assert!(reason.contains("Schema mismatch"), "{reason}"),
        other => panic!("expected failure, got {other}"),
    }
    for task in [TaskType::BrainNutrients, TaskType::BioactiveCompounds, TaskType::NutrientInteractions] {
        assert_eq!(outcome.task(task).unwrap().state, TaskState::Ready);
    }

    let retained = outcome.retained.as_ref().unwrap();
    assert!(retained.brain_nutrients.is_some());
    assert!(retained.bioactive_compounds.is_some());
    assert!(retained.nutrient_interactions.is_some());
    assert!(retained.mental_health_impacts.is_none());
}

#[tokio::test]
async fn test_transient_failure_after_retries_fails_the_task() {
    let backend = MockBackend::new("mock").with_responder(|req: &LlmRequest| {
        if prompt_kind(req.user_prompt()) == Some("bioactive_compounds") {
            return Err(LlmError::RateLimited { retry_after_ms: None });
        }
        pipeline_reply(req)
    });
    let h = harness(backend, PipelineConfig::default());

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();

    assert_eq!(summary.record("salmon_wild").unwrap().status, RecordStatus::Incomplete);
    assert_eq!(summary.failed_tasks(), 1);
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test]
async fn test_dry_run_validates_without_calibrating_or_writing() {
    let config = PipelineConfig { dry_run: true, ..Default::default() };
    let h = harness(pipeline_backend(), config);

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();
    let outcome = summary.record("salmon_wild").unwrap();

    assert_eq!(outcome.status, RecordStatus::DryRun);
    assert_eq!(h.backend.call_count(), 4);
    assert_eq!(h.store.commit_count(), 0);
    let retained = outcome.retained.as_ref().unwrap();
    assert_eq!(retained.task_types().len(), 4);
    assert!(retained.calibration_notes.is_empty());
}

#[tokio::test]
async fn test_calibration_cannot_raise_uncited_claims_into_cited_band() {
    let backend = MockBackend::new("mock").with_responder(|req: &LlmRequest| {
        let prompt = req.user_prompt();
        if prompt_kind(prompt) == Some("confidence_calibration") && prompt.contains("mental_health_impacts data") {
            let reply = calibration_reply(prompt, &["strong trial evidence"], |data| {
                data["impacts"][1]["confidence"] = json!(9);
            });
            return reply.ok_or_else(|| LlmError::Unavailable("no data".into()));
        }
        pipeline_reply(req)
    });
    let config = PipelineConfig { task_types: vec![TaskType::MentalHealthImpacts], ..Default::default() };
    let h = harness(backend, config);

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();
    let outcome = summary.record("salmon_wild").unwrap();
    assert_eq!(outcome.status, RecordStatus::Committed { version: 1 });
    assert_eq!(outcome.task(TaskType::MentalHealthImpacts).unwrap().caps_applied, 1);

    let record = h.store.get("salmon_wild").await.unwrap();
    assert_eq!(record.mental_health_impacts[1].confidence, 7.0);
    let notes = &record.data_quality.calibration_notes[&TaskType::MentalHealthImpacts];
    assert_eq!(notes[0], "strong trial evidence");
    assert!(notes[1].contains("capped to 7"));
}

#[tokio::test]
async fn test_batch_skips_records_that_are_already_enriched() {
    let h = harness(pipeline_backend(), PipelineConfig::default());

    let first = h.orchestrator.run_batch(FoodFilter::default()).await.unwrap();
    assert_eq!(first.committed(), 2);

    let second = h.orchestrator.run_batch(FoodFilter::default()).await.unwrap();
    assert!(second.records.is_empty());
    assert_eq!(h.store.commit_count(), 2);
}

#[tokio::test]
async fn test_force_reprocess_selects_enriched_records() {
    let h = harness(pipeline_backend(), PipelineConfig { force_reprocess: true, ..Default::default() });

    h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap();
    let filter = FoodFilter { food_ids: vec!["salmon_wild".into()], ..Default::default() };
    let summary = h.orchestrator.run_batch(filter).await.unwrap();

    assert_eq!(summary.record("salmon_wild").unwrap().status, RecordStatus::Committed { version: 2 });
}

#[tokio::test]
async fn test_unknown_record_is_reported_not_fatal() {
    let h = harness(pipeline_backend(), PipelineConfig::default());

    let summary = h.orchestrator.run_ids(vec!["missing".into(), "salmon_wild".into()]).await.unwrap();

    assert!(matches!(summary.record("missing").unwrap().status, RecordStatus::Unreadable(_)));
    assert_eq!(summary.committed(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_new_records() {
    let h = harness(pipeline_backend(), PipelineConfig::default());
    h.shutdown.send(true).unwrap();

    let summary = h.orchestrator.run_ids(vec!["salmon_wild".into(), "spinach_raw".into()]).await.unwrap();

    assert!(summary.records.iter().all(|r| r.status == RecordStatus::Cancelled));
    assert_eq!(h.backend.call_count(), 0);
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test]
async fn test_failing_gate_refuses_the_batch() {
    // Echoing calibration keeps every confidence, so the fixture's expected
    // increases are not observed.
    let config = PipelineConfig { known_answer_gate: true, ..Default::default() };
    let h = harness(pipeline_backend(), config);

    let err = h.orchestrator.run_ids(vec!["salmon_wild".into()]).await.unwrap_err();

    assert!(matches!(err, EnrichError::UntrustedTemplate { .. }));
    assert_eq!(h.backend.call_count(), 1);
    assert_eq!(h.store.commit_count(), 0);
}

/// Store where another writer bumps the record between read and commit.
struct ConcurrentEditStore {
    inner: Arc<MemoryFoodStore>,
}

#[async_trait]
impl FoodStore for ConcurrentEditStore {
    async fn read_food_record(&self, food_id: &str) -> nutripsych_db::Result<FoodRecord> {
        self.inner.read_food_record(food_id).await
    }

    async fn commit_enrichment(
        &self,
        food_id: &str,
        merged: &MergedEnrichment,
        expected_version: u64,
    ) -> nutripsych_db::Result<u64> {
        let mut edited = self.inner.read_food_record(food_id).await?;
        edited.metadata.version += 1;
        self.inner.insert(edited).await;
        self.inner.commit_enrichment(food_id, merged, expected_version).await
    }

    async fn list_food_ids(&self, filter: &FoodFilter) -> nutripsych_db::Result<Vec<String>> {
        self.inner.list_food_ids(filter).await
    }
}

#[tokio::test]
async fn test_commit_conflict_fails_every_task_and_leaves_record() {
    let inner = Arc::new(MemoryFoodStore::with_records([walnut_record()]));
    let backend = Arc::new(pipeline_backend());
    let (_shutdown, rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(
        TemplateStore::builtin().unwrap(),
        Arc::new(CompletionClient::new(backend.clone(), no_retry())),
        Arc::new(ConcurrentEditStore { inner: inner.clone() }),
        Arc::new(RangeTable::default()),
        ModelSettings::default(),
        PipelineConfig::default(),
        rx,
    );

    let summary = orchestrator.run_ids(vec!["walnuts".into()]).await.unwrap();
    let outcome = summary.record("walnuts").unwrap();

    match &outcome.status {
        RecordStatus::CommitFailed(reason) => {
            assert!(reason.contains("expected version 0, found 1"), "{reason}")
        }
        other => panic!("expected commit failure, got {other:?}"),
    }
    assert_eq!(outcome.tasks.len(), 4);
    assert!(outcome.tasks.iter().all(|t| matches!(t.state, TaskState::Failed(_))));
    assert_eq!(summary.committed(), 0);
    assert_eq!(backend.call_count(), 8);

    assert_eq!(inner.commit_count(), 0);
    let stored = inner.get("walnuts").await.unwrap();
    assert_eq!(stored.metadata.version, 1);
    for task in TaskType::ALL {
        assert!(!stored.has_enrichment(task), "{task} should not be written");
    }
}
