//! Configuration loading for nutripsych.
//! Reads nutripsych.toml from the current directory or the path in the
//! NUTRIPSYCH_CONFIG env var. Every field has a default.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use nutripsych_common::TaskType;
use nutripsych_enrich::{ModelSettings, NumericRange, RangeTable, TaskOverride};
use nutripsych_llm::{CompletionOptions, RetryPolicy};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    /// Amount range overrides keyed by dotted path or field name.
    #[serde(default)]
    pub ranges: BTreeMap<String, NumericRange>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `openai`, `anthropic` or `openai_compatible`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Required for `openai_compatible` (Ollama, vLLM, …).
    pub base_url: Option<String>,
    /// Falls back to OPENAI_API_KEY / ANTHROPIC_API_KEY when unset.
    #[serde(default, deserialize_with = "deserialize_secret", skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    /// Per-task overrides, keyed by task type or `confidence_calibration`.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskOverride>,
}

fn default_backend()             -> String { "openai".to_string() }
fn default_model()               -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens()          -> u32    { 2000 }
fn default_temperature()         -> f32    { 0.2 }
fn default_timeout_secs()        -> u64    { 60 }
fn default_rate_limit_delay_ms() -> u64    { 500 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            base_url: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            tasks: BTreeMap::new(),
        }
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts()  -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 2000 }
fn default_max_delay_ms()  -> u64 { 30_000 }
fn default_multiplier()    -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_record_concurrency")]
    pub record_concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_task_types")]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub force_reprocess: bool,
    #[serde(default = "bool_true")]
    pub known_answer_gate: bool,
    /// JSON object of reference data keyed by task type.
    pub reference_data_file: Option<String>,
}

fn default_workers()            -> usize { 4 }
fn default_record_concurrency() -> usize { 2 }
fn default_batch_size()         -> usize { 10 }
fn bool_true()                  -> bool  { true }

fn default_task_types() -> Vec<String> {
    TaskType::ALL.iter().map(|t| t.as_str().to_string()).collect()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            record_concurrency: default_record_concurrency(),
            batch_size: default_batch_size(),
            task_types: default_task_types(),
            force_reprocess: false,
            known_answer_gate: true,
            reference_data_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "./data/foods".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Directory of template JSON files that replace built-ins by id.
    pub dir: Option<String>,
}

#[cfg(test)]
mod tests;

impl Config {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::warn!(path, "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        Self::parse(&content).with_context(|| format!("parsing {path}"))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.llm.backend.as_str() {
            "openai" | "anthropic" => {}
            "openai_compatible" if self.llm.base_url.is_some() => {}
            "openai_compatible" => bail!("llm.base_url is required for the openai_compatible backend"),
            other => bail!("unknown llm.backend '{other}'"),
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            bail!("retry.multiplier must be a finite number of at least 1.0, got {}", self.retry.multiplier);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.pipeline.workers == 0 || self.pipeline.record_concurrency == 0 || self.pipeline.batch_size == 0 {
            bail!("pipeline.workers, record_concurrency and batch_size must be positive");
        }
        self.task_types()?;
        for (key, range) in &self.ranges {
            if !(range.min <= range.max) {
                bail!("ranges.{key}: min {} exceeds max {}", range.min, range.max);
            }
        }
        Ok(())
    }

    pub fn task_types(&self) -> anyhow::Result<Vec<TaskType>> {
        self.pipeline
            .task_types
            .iter()
            .map(|t| t.parse::<TaskType>().with_context(|| format!("pipeline.task_types: '{t}'")))
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            base: CompletionOptions {
                model: Some(self.llm.model.clone()),
                max_tokens: self.llm.max_tokens,
                temperature: self.llm.temperature,
                timeout: Duration::from_secs(self.llm.timeout_secs),
                ..Default::default()
            },
            per_task: self.llm.tasks.clone(),
        }
    }

    pub fn range_table(&self) -> RangeTable {
        RangeTable::new(self.ranges.clone())
    }

    /// Configuration as TOML with the API key masked.
    pub fn redacted(&self) -> anyhow::Result<String> {
        let mut value = toml::Value::try_from(self)?;
        if self.llm.api_key.is_some() {
            if let Some(llm) = value.get_mut("llm").and_then(toml::Value::as_table_mut) {
                llm.insert("api_key".to_string(), toml::Value::String("***".to_string()));
            }
        }
        Ok(toml::to_string_pretty(&value)?)
    }
}
