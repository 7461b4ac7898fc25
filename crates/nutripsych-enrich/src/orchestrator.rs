//! Enrichment orchestrator.
//!
//! Per food record:
//!   1. Read the record (working copy, with its version)
//!   2. Run one task per configured task type, concurrently:
//!      render -> complete -> validate -> calibrate
//!   3. If every task succeeded, commit the merged output in one write
//!   4. Otherwise commit nothing and keep the successful outputs in memory
//!
//! Completion calls across the whole run share one worker pool. A shutdown
//! signal stops new records and new completion dispatches; calls already in
//! flight finish or time out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use nutripsych_common::{FoodRecord, MergedEnrichment, TaskType};
use nutripsych_db::{FoodFilter, FoodStore};
use nutripsych_llm::CompletionClient;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::calibrate::Calibrator;
use crate::error::{EnrichError, Result};
use crate::known_answer::KnownAnswerRunner;
use crate::schema::RangeTable;
use crate::settings::ModelSettings;
use crate::template::{Slots, TemplateStore, CALIBRATION_TEMPLATE_ID};
use crate::validate::{parse_and_validate, RangeViolation};

// ── Task state machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Rendering,
    AwaitingCompletion,
    Validating,
    Calibrating,
    /// Every stage succeeded; output waits for the record commit.
    Ready,
    Committed,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Committed | TaskState::Failed(_))
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        if let Failed(_) = next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Rendering)
                | (Rendering, AwaitingCompletion)
                | (AwaitingCompletion, Validating)
                | (Validating, Calibrating)
                | (Validating, Ready)
                | (Calibrating, Ready)
                | (Ready, Committed)
        )
    }

    fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Rendering => "rendering",
            TaskState::AwaitingCompletion => "awaiting_completion",
            TaskState::Validating => "validating",
            TaskState::Calibrating => "calibrating",
            TaskState::Ready => "ready",
            TaskState::Committed => "committed",
            TaskState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One unit of work: one task type for one food record.
#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub task_type: TaskType,
    pub food_id: String,
    pub template_id: String,
    pub reference_data: Option<Value>,
    state: TaskState,
}

impl EnrichmentTask {
    pub fn new(task_type: TaskType, food_id: impl Into<String>, reference_data: Option<Value>) -> Self {
        Self {
            task_type,
            food_id: food_id.into(),
            template_id: task_type.default_template_id().to_string(),
            reference_data,
            state: TaskState::Pending,
        }
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(EnrichError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(food_id = %self.food_id, task = %self.task_type, from = %self.state, to = %next, "Task transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed`. No-op on a task that already finished.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let next = TaskState::Failed(reason.into());
        if self.state.can_transition_to(&next) {
            warn!(food_id = %self.food_id, task = %self.task_type, state = %next, "Task failed");
            self.state = next;
        }
    }
}

// ── Configuration & outcomes ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Task types run per record. All of them must succeed for a commit.
    pub task_types: Vec<TaskType>,
    /// Concurrent completion calls across the run.
    pub workers: usize,
    /// Records processed concurrently.
    pub record_concurrency: usize,
    /// Records per progress batch.
    pub batch_size: usize,
    /// Select records that already carry every requested enrichment too.
    pub force_reprocess: bool,
    /// Run the calibration template's known-answer test before a batch and
    /// refuse to run when it fails.
    pub known_answer_gate: bool,
    /// Stop after validation: no calibration, no commit.
    pub dry_run: bool,
    pub reference_data: BTreeMap<TaskType, Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            task_types: TaskType::ALL.to_vec(),
            workers: 4,
            record_concurrency: 2,
            batch_size: 10,
            force_reprocess: false,
            known_answer_gate: false,
            dry_run: false,
            reference_data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Committed { version: u64 },
    DryRun,
    /// At least one task failed; nothing was written.
    Incomplete,
    CommitFailed(String),
    Unreadable(String),
    Cancelled,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Committed { version } => write!(f, "committed v{version}"),
            RecordStatus::DryRun => f.write_str("dry-run"),
            RecordStatus::Incomplete => f.write_str("not committed"),
            RecordStatus::CommitFailed(e) => write!(f, "commit failed: {e}"),
            RecordStatus::Unreadable(e) => write!(f, "unreadable: {e}"),
            RecordStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_type: TaskType,
    pub state: TaskState,
    pub range_violations: usize,
    pub caps_applied: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub food_id: String,
    pub status: RecordStatus,
    pub tasks: Vec<TaskReport>,
    /// Successful task outputs that were not written (dry run or a failed
    /// sibling task).
    pub retained: Option<MergedEnrichment>,
    pub elapsed_ms: u64,
}

impl RecordOutcome {
    fn without_tasks(food_id: &str, status: RecordStatus) -> Self {
        Self { food_id: food_id.to_string(), status, tasks: Vec::new(), retained: None, elapsed_ms: 0 }
    }

    pub fn task(&self, task_type: TaskType) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_type == task_type)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub records: Vec<RecordOutcome>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn committed(&self) -> usize {
        self.records.iter().filter(|r| matches!(r.status, RecordStatus::Committed { .. })).count()
    }

    pub fn failed_tasks(&self) -> usize {
        self.records
            .iter()
            .flat_map(|r| &r.tasks)
            .filter(|t| matches!(t.state, TaskState::Failed(_)))
            .count()
    }

    pub fn record(&self, food_id: &str) -> Option<&RecordOutcome> {
        self.records.iter().find(|r| r.food_id == food_id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.records {
            writeln!(f, "{} [{}] {}ms", r.food_id, r.status, r.elapsed_ms)?;
            for t in &r.tasks {
                write!(f, "  {:<22} {}", t.task_type.as_str(), t.state)?;
                if t.range_violations > 0 {
                    write!(f, " clamped={}", t.range_violations)?;
                }
                if t.caps_applied > 0 {
                    write!(f, " capped={}", t.caps_applied)?;
                }
                writeln!(f)?;
            }
        }
        write!(
            f,
            "{} record(s), {} committed, {} failed task(s) in {:.1}s",
            self.records.len(),
            self.committed(),
            self.failed_tasks(),
            self.elapsed.as_secs_f64()
        )
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

struct TaskOutput {
    payload: Value,
    notes: Vec<String>,
    violations: Vec<RangeViolation>,
    caps: usize,
    calibrated: bool,
}

pub struct Orchestrator {
    templates: Arc<TemplateStore>,
    client: Arc<CompletionClient>,
    store: Arc<dyn FoodStore>,
    ranges: Arc<RangeTable>,
    settings: ModelSettings,
    config: PipelineConfig,
    calibrator: Calibrator,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        templates: Arc<TemplateStore>,
        client: Arc<CompletionClient>,
        store: Arc<dyn FoodStore>,
        ranges: Arc<RangeTable>,
        settings: ModelSettings,
        config: PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let calibrator = Calibrator::new(
            templates.clone(),
            client.clone(),
            ranges.clone(),
            settings.options_for(CALIBRATION_TEMPLATE_ID),
        );
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self { templates, client, store, ranges, settings, config, calibrator, permits, shutdown }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the known-answer test of the calibration template and refuse to
    /// continue when it fails.
    pub async fn check_gate(&self) -> Result<()> {
        let template = self.templates.get(CALIBRATION_TEMPLATE_ID)?;
        let runner = KnownAnswerRunner::new(
            self.templates.clone(),
            self.client.clone(),
            self.ranges.clone(),
            self.settings.clone(),
        );
        let report = runner.run_known_answer_tests(template).await?;
        if !report.passed {
            return Err(EnrichError::UntrustedTemplate {
                template_id: report.template_id,
                version: report.version,
            });
        }
        info!(template_id = %report.template_id, version = %report.version, "Calibration template trusted");
        Ok(())
    }

    /// Enrich every record matching `filter`. Unless `force_reprocess` is
    /// set, records that already carry every configured enrichment are
    /// skipped.
    pub async fn run_batch(&self, filter: FoodFilter) -> Result<RunSummary> {
        let mut filter = filter;
        if !self.config.force_reprocess && filter.missing_any_of.is_empty() {
            filter.missing_any_of = self.config.task_types.clone();
        }
        let ids = self.store.list_food_ids(&filter).await?;
        self.run_ids(ids).await
    }

    /// Enrich the given records.
    pub async fn run_ids(&self, ids: Vec<String>) -> Result<RunSummary> {
        if self.config.known_answer_gate && !self.config.dry_run {
            self.check_gate().await?;
        }

        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let batches = ids.len().div_ceil(batch_size);
        info!(records = ids.len(), batches, dry_run = self.config.dry_run, "Starting enrichment run");

        let mut records = Vec::with_capacity(ids.len());
        for (n, chunk) in ids.chunks(batch_size).enumerate() {
            if self.shutting_down() {
                warn!(remaining = ids.len() - records.len(), "Shutdown requested, not starting further records");
                records.extend(chunk.iter().map(|id| RecordOutcome::without_tasks(id, RecordStatus::Cancelled)));
                continue;
            }
            let outcomes: Vec<RecordOutcome> = stream::iter(chunk)
                .map(|id| self.run_record(id))
                .buffer_unordered(self.config.record_concurrency.max(1))
                .collect()
                .await;
            let committed = outcomes.iter().filter(|o| matches!(o.status, RecordStatus::Committed { .. })).count();
            info!(batch = n + 1, batches, records = outcomes.len(), committed, "Batch complete");
            records.extend(outcomes);
        }
        records.sort_by(|a, b| a.food_id.cmp(&b.food_id));

        let summary = RunSummary { records, elapsed: started.elapsed() };
        info!(
            records = summary.records.len(),
            committed = summary.committed(),
            failed_tasks = summary.failed_tasks(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Enrichment run finished"
        );
        Ok(summary)
    }

    #[instrument(skip_all, fields(food_id = %food_id))]
    pub async fn run_record(&self, food_id: &str) -> RecordOutcome {
        let started = Instant::now();
        if self.shutting_down() {
            return RecordOutcome::without_tasks(food_id, RecordStatus::Cancelled);
        }
        let record = match self.store.read_food_record(food_id).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Could not read food record");
                return RecordOutcome::without_tasks(food_id, RecordStatus::Unreadable(e.to_string()));
            }
        };

        let tasks: Vec<EnrichmentTask> = self
            .config
            .task_types
            .iter()
            .map(|t| EnrichmentTask::new(*t, food_id, self.config.reference_data.get(t).cloned()))
            .collect();
        let results = join_all(tasks.into_iter().map(|task| self.run_task(&record, task))).await;

        let mut tasks = Vec::with_capacity(results.len());
        let mut reports = Vec::with_capacity(results.len());
        let mut merged = MergedEnrichment::default();
        for (mut task, output, elapsed_ms) in results {
            let (violations, caps) = match output {
                Some(out) => {
                    let counts = (out.violations.len(), out.caps);
                    match merged.insert(task.task_type, out.payload) {
                        Ok(()) => {
                            if out.calibrated {
                                merged.calibration_notes.insert(task.task_type, out.notes);
                                merged.calibrated_at = Some(Utc::now());
                            }
                        }
                        Err(e) => task.fail(format!("payload does not fit the record: {e}")),
                    }
                    counts
                }
                None => (0, 0),
            };
            reports.push((violations, caps, elapsed_ms));
            tasks.push(task);
        }

        let all_ready = tasks.iter().all(|t| *t.state() == TaskState::Ready);
        let status = if !all_ready {
            let failed: Vec<_> = tasks.iter().filter(|t| !matches!(t.state(), TaskState::Ready)).map(|t| t.task_type).collect();
            warn!(failed = ?failed, "Record not committed");
            RecordStatus::Incomplete
        } else if self.config.dry_run {
            RecordStatus::DryRun
        } else {
            self.commit(&record, &merged, &mut tasks).await
        };

        let retained = match status {
            RecordStatus::Committed { .. } => None,
            _ if merged.is_empty() => None,
            _ => Some(merged),
        };
        let tasks = tasks
            .into_iter()
            .zip(reports)
            .map(|(t, (range_violations, caps_applied, elapsed_ms))| TaskReport {
                task_type: t.task_type,
                state: t.state().clone(),
                range_violations,
                caps_applied,
                elapsed_ms,
            })
            .collect();

        RecordOutcome {
            food_id: food_id.to_string(),
            status,
            tasks,
            retained,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn commit(
        &self,
        record: &FoodRecord,
        merged: &MergedEnrichment,
        tasks: &mut [EnrichmentTask],
    ) -> RecordStatus {
        match self
            .store
            .commit_enrichment(&record.food_id, merged, record.metadata.version)
            .await
            .map_err(EnrichError::from)
        {
            Ok(version) => {
                for t in tasks.iter_mut() {
                    if let Err(e) = t.advance(TaskState::Committed) {
                        error!(error = %e, "Task state out of sync after commit");
                    }
                }
                info!(version, tasks = ?merged.task_types(), "Enrichment committed");
                RecordStatus::Committed { version }
            }
            Err(e) => {
                error!(error = %e, "Commit failed");
                for t in tasks.iter_mut() {
                    t.fail(e.to_string());
                }
                RecordStatus::CommitFailed(e.to_string())
            }
        }
    }

    async fn run_task(
        &self,
        record: &FoodRecord,
        mut task: EnrichmentTask,
    ) -> (EnrichmentTask, Option<TaskOutput>, u64) {
        let started = Instant::now();
        let output = match self.drive_task(record, &mut task).await {
            Ok(out) => Some(out),
            Err(e) => {
                task.fail(e.to_string());
                None
            }
        };
        (task, output, started.elapsed().as_millis() as u64)
    }

    async fn drive_task(&self, record: &FoodRecord, task: &mut EnrichmentTask) -> Result<TaskOutput> {
        task.advance(TaskState::Rendering)?;
        let slots = task_slots(record, task.task_type, task.reference_data.as_ref())?;
        let prompt = self.templates.render(&task.template_id, &slots)?;

        if self.shutting_down() {
            return Err(EnrichError::Cancelled);
        }
        task.advance(TaskState::AwaitingCompletion)?;
        let options = self.settings.options_for(task.task_type.as_str());
        let raw = {
            let _permit = self.permits.acquire().await.map_err(|_| EnrichError::Cancelled)?;
            self.client.complete(&prompt.system, &prompt.user, &options).await?
        };

        task.advance(TaskState::Validating)?;
        let result = parse_and_validate(&raw, task.task_type, &self.ranges)?;

        if self.config.dry_run {
            task.advance(TaskState::Ready)?;
            return Ok(TaskOutput {
                violations: result.range_violations,
                payload: result.payload,
                notes: Vec::new(),
                caps: 0,
                calibrated: false,
            });
        }

        if self.shutting_down() {
            return Err(EnrichError::Cancelled);
        }
        task.advance(TaskState::Calibrating)?;
        let calibrated = {
            let _permit = self.permits.acquire().await.map_err(|_| EnrichError::Cancelled)?;
            self.calibrator
                .calibrate(&result, &record.name, task.task_type, task.reference_data.as_ref())
                .await?
        };

        task.advance(TaskState::Ready)?;
        let mut violations = result.range_violations;
        violations.extend(calibrated.range_violations);
        Ok(TaskOutput {
            payload: calibrated.payload,
            notes: calibrated.calibration_notes,
            violations,
            caps: calibrated.caps_applied.len(),
            calibrated: true,
        })
    }
}

/// Slot values drawn from the record. Templates only read the slots they
/// reference.
fn task_slots(record: &FoodRecord, task: TaskType, reference: Option<&Value>) -> Result<Slots> {
    let slots = Slots::new()
        .text("food_name", record.name.as_str())
        .text("food_category", record.category.as_str())
        .json("standard_nutrients_json", serde_json::to_value(&record.standard_nutrients)?)
        .maybe_text("scientific_context", record.description.as_deref())
        .maybe_json("brain_nutrients_json", record.enrichment_json(TaskType::BrainNutrients))
        .maybe_json("bioactive_compounds_json", record.enrichment_json(TaskType::BioactiveCompounds));
    Ok(match task {
        TaskType::BrainNutrients => slots
            .maybe_json("existing_brain_nutrients_json", record.enrichment_json(TaskType::BrainNutrients))
            .maybe_json("reference_foods_json", reference.cloned()),
        _ => slots,
    })
}
