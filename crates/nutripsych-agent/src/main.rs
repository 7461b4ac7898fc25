//! nutripsych: LLM enrichment of food records with brain-nutrient,
//! bioactive-compound, mental-health-impact and nutrient-interaction data.
//! Entry point for the command-line binary.

mod config;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nutripsych_common::TaskType;
use nutripsych_db::{FoodFilter, JsonDirStore};
use nutripsych_enrich::{
    KnownAnswerRunner, Orchestrator, PipelineConfig, RecordStatus, TemplateStore,
};
use nutripsych_llm::backend::{AnthropicBackend, OpenAiBackend, OpenAiCompatibleBackend};
use nutripsych_llm::{CompletionClient, LlmBackend};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Parser)]
#[command(name = "nutripsych")]
#[command(about = "Enrich food records with nutritional psychiatry data", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "NUTRIPSYCH_CONFIG", default_value = "nutripsych.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enrich selected food records
    Enrich {
        /// Explicit record ids (repeatable)
        #[arg(long = "food-id")]
        food_ids: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        /// Substring match on the food name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Reprocess records that already carry every enrichment
        #[arg(long)]
        force: bool,
        /// Validate only: no calibration, nothing written
        #[arg(long)]
        dry_run: bool,
        /// Skip the calibration template's known-answer check
        #[arg(long)]
        skip_gate: bool,
    },
    /// Run known-answer regression tests
    KnownAnswer {
        /// Only this template (default: every template with a fixture)
        #[arg(long)]
        template: Option<String>,
    },
    /// List loaded templates
    Templates,
    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nutripsych=debug,info")),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config, "nutripsych starting");
    let config = Config::load(&cli.config)?;

    let templates = match &config.templates.dir {
        Some(dir) => Arc::new(TemplateStore::with_overrides(Path::new(dir))?),
        None => TemplateStore::builtin()?,
    };

    match cli.command {
        Command::Templates => {
            for t in templates.templates() {
                let slots = templates.referenced_slots(&t.template_id)?;
                println!(
                    "{} v{} [{:?}{}] fixture={} slots={}",
                    t.template_id,
                    t.version,
                    t.stage,
                    t.task_type.map(|k| format!(", {k}")).unwrap_or_default(),
                    t.known_answer_test.is_some(),
                    slots.into_iter().collect::<Vec<_>>().join(","),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", config.redacted()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::KnownAnswer { template } => {
            let (client, _shutdown) = build_client(&config)?;
            let runner = KnownAnswerRunner::new(
                templates.clone(),
                client,
                Arc::new(config.range_table()),
                config.model_settings(),
            );
            let results = match template {
                Some(id) => {
                    let t = templates.get(&id)?;
                    vec![(id, runner.run_known_answer_tests(t).await)]
                }
                None => runner.run_all().await,
            };
            let mut ok = true;
            for (id, result) in results {
                match result {
                    Ok(report) => {
                        ok &= report.passed;
                        print!("{report}");
                    }
                    Err(e) => {
                        ok = false;
                        println!("{id}: ERROR {e}");
                    }
                }
            }
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Enrich { food_ids, category, name, limit, force, dry_run, skip_gate } => {
            let (client, shutdown) = build_client(&config)?;
            let store = Arc::new(JsonDirStore::open(&config.store.path).await?);
            let pipeline = PipelineConfig {
                task_types: config.task_types()?,
                workers: config.pipeline.workers,
                record_concurrency: config.pipeline.record_concurrency,
                batch_size: config.pipeline.batch_size,
                force_reprocess: force || config.pipeline.force_reprocess,
                known_answer_gate: config.pipeline.known_answer_gate && !skip_gate,
                dry_run,
                reference_data: load_reference_data(config.pipeline.reference_data_file.as_deref())?,
            };
            let orchestrator = Orchestrator::new(
                templates,
                client,
                store,
                Arc::new(config.range_table()),
                config.model_settings(),
                pipeline,
                shutdown,
            );

            let summary = if food_ids.is_empty() {
                let filter = FoodFilter { category, name_contains: name, limit, ..Default::default() };
                orchestrator.run_batch(filter).await?
            } else {
                orchestrator.run_ids(food_ids).await?
            };
            println!("{summary}");

            let all_good = summary
                .records
                .iter()
                .all(|r| matches!(r.status, RecordStatus::Committed { .. } | RecordStatus::DryRun));
            Ok(if all_good { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

/// Completion client for the configured backend, wired to Ctrl-C.
fn build_client(config: &Config) -> anyhow::Result<(Arc<CompletionClient>, watch::Receiver<bool>)> {
    let backend = build_backend(config)?;
    info!(backend = backend.backend_name(), model = backend.model_id(), "LLM backend ready");

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, finishing in-flight calls");
            let _ = tx.send(true);
        }
    });

    let client = CompletionClient::new(backend, config.retry_policy())
        .with_rate_limit_delay(Duration::from_millis(config.llm.rate_limit_delay_ms))
        .with_shutdown(rx.clone());
    Ok((Arc::new(client), rx))
}

fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn LlmBackend>> {
    let llm = &config.llm;
    let key = |env: &str| -> Option<String> {
        llm.api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .or_else(|| std::env::var(env).ok().filter(|k| !k.is_empty()))
    };
    let backend: Arc<dyn LlmBackend> = match llm.backend.as_str() {
        "openai" => {
            let Some(key) = key("OPENAI_API_KEY") else {
                bail!("OpenAI backend configured but no API key found (set llm.api_key or OPENAI_API_KEY)");
            };
            Arc::new(OpenAiBackend::new(key, &llm.model))
        }
        "anthropic" => {
            let Some(key) = key("ANTHROPIC_API_KEY") else {
                bail!("Anthropic backend configured but no API key found (set llm.api_key or ANTHROPIC_API_KEY)");
            };
            Arc::new(AnthropicBackend::new(key, &llm.model))
        }
        "openai_compatible" => {
            let base_url = llm.base_url.clone().context("llm.base_url is required")?;
            Arc::new(OpenAiCompatibleBackend::new(base_url, &llm.model, key("OPENAI_API_KEY")))
        }
        other => bail!("unknown llm.backend '{other}'"),
    };
    Ok(backend)
}

fn load_reference_data(path: Option<&str>) -> anyhow::Result<BTreeMap<TaskType, Value>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let data: BTreeMap<TaskType, Value> =
        serde_json::from_str(&content).with_context(|| format!("parsing {path}"))?;
    info!(path, tasks = data.len(), "Reference data loaded");
    Ok(data)
}
