use super::*;
use secrecy::ExposeSecret;

#[test]
fn test_empty_file_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.llm.backend, "openai");
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.pipeline.workers, 4);
    assert_eq!(config.llm.rate_limit_delay_ms, 500);
    assert!(config.pipeline.known_answer_gate);
    assert_eq!(config.task_types().unwrap(), TaskType::ALL.to_vec());
}

#[test]
fn test_multiplier_of_one_is_accepted() {
    let config = Config::parse("[retry]\nmultiplier = 1.0").unwrap();
    assert_eq!(config.retry_policy().multiplier, 1.0);
}

#[test]
fn test_sections_and_task_overrides() {
    let config = Config::parse(
        r#"
        [llm]
        backend = "openai_compatible"
        base_url = "http://localhost:11434/v1"
        model = "llama3.1:8b"
        api_key = "sk-local"

        [llm.tasks.confidence_calibration]
        temperature = 0.1

        [pipeline]
        task_types = ["brain_nutrients", "mental_health_impacts"]
        workers = 2

        [ranges]
        "omega3.dha_mg" = { min = 0, max = 5000 }
        "#,
    )
    .unwrap();

    assert_eq!(config.llm.api_key.as_ref().map(|k| k.expose_secret()), Some("sk-local"));
    assert_eq!(
        config.task_types().unwrap(),
        vec![TaskType::BrainNutrients, TaskType::MentalHealthImpacts]
    );

    let settings = config.model_settings();
    assert_eq!(settings.options_for("confidence_calibration").temperature, 0.1);
    assert_eq!(settings.options_for("brain_nutrients").model.as_deref(), Some("llama3.1:8b"));
    assert_eq!(config.ranges["omega3.dha_mg"], NumericRange { min: 0.0, max: 5000.0 });
}

#[test]
fn test_invalid_values_are_rejected() {
    assert!(Config::parse("[llm]\nbackend = \"gemini\"").is_err());
    assert!(Config::parse("[llm]\nbackend = \"openai_compatible\"").is_err());
    assert!(Config::parse("[retry]\nmax_attempts = 0").is_err());
    assert!(Config::parse("[retry]\nmultiplier = -1.0").is_err());
    assert!(Config::parse("[retry]\nmultiplier = 0.5").is_err());
    assert!(Config::parse("[retry]\nmultiplier = nan").is_err());
    assert!(Config::parse("[retry]\nmultiplier = inf").is_err());
    assert!(Config::parse("[retry]\nbase_delay_ms = 60000").is_err());
    assert!(Config::parse("[pipeline]\ntask_types = [\"vitamins\"]").is_err());
    assert!(Config::parse("[ranges]\nzinc_mg = { min = 5, max = 1 }").is_err());
}

#[test]
fn test_redacted_masks_api_key() {
    let config = Config::parse("[llm]\napi_key = \"sk-secret-123\"").unwrap();
    let dump = config.redacted().unwrap();
    assert!(!dump.contains("sk-secret-123"));
    assert!(dump.contains("api_key = \"***\""));
}

#[test]
fn test_empty_api_key_counts_as_unset() {
    let config = Config::parse("[llm]\napi_key = \"\"").unwrap();
    assert!(config.llm.api_key.is_none());
}
