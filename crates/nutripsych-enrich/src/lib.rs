//! Nutripsych enrichment pipeline.
//!
//! Prompt templates -> completion -> validation -> confidence calibration ->
//! one all-or-nothing commit per food record.

pub mod calibrate;
pub mod error;
pub mod known_answer;
pub mod orchestrator;
pub mod schema;
pub mod settings;
pub mod template;
pub mod validate;

pub use calibrate::{CalibrationResult, Calibrator, CitationCap};
pub use error::{EnrichError, Result};
pub use known_answer::{KnownAnswerRunner, TestReport};
pub use orchestrator::{
    EnrichmentTask, Orchestrator, PipelineConfig, RecordOutcome, RecordStatus, RunSummary, TaskReport, TaskState,
};
pub use schema::{NumericRange, RangeTable};
pub use settings::{ModelSettings, TaskOverride};
pub use template::{PromptTemplate, RenderedPrompt, Slots, TemplateStore, CALIBRATION_TEMPLATE_ID};
pub use validate::{parse_and_validate, EnrichmentResult, RangeViolation};
