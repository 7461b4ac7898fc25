//! LLM backend trait and concrete implementations.
//!
//! Backends:
//!   OpenAiBackend            OpenAI API (gpt-4o, gpt-4o-mini, …)
//!   OpenAiCompatibleBackend  any OpenAI-compatible endpoint (Ollama,
//!                            LMStudio, vLLM, Groq, OpenRouter, …)
//!   AnthropicBackend         Anthropic Messages API (claude-*)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Completion incomplete: {reason}")]
    Incomplete { reason: String },
    #[error("API error [{status}]: {message}")]
    ApiError { status: u16, message: String },
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    ///
    /// Rate limits, timeouts, connection failures and 5xx responses are
    /// transient. Auth failures, malformed requests, truncated or filtered
    /// output and undecodable bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect(),
            LlmError::RateLimited { .. } | LlmError::Timeout(_) => true,
            LlmError::ApiError { status, .. } => *status == 408 || *status >= 500,
            LlmError::Serde(_) | LlmError::Unavailable(_) | LlmError::Incomplete { .. } => false,
        }
    }
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the backend to constrain output to a single JSON object.
    #[serde(default)]
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn system_prompt(&self) -> &str {
        self.messages.iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn user_prompt(&self) -> &str {
        self.messages.iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn model_id(&self) -> &str;
    fn backend_name(&self) -> &str;
    fn is_local(&self) -> bool;
}

// ── Helper: parse OpenAI-style response ──────────────────────────────────────

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let choice = &json["choices"][0];
    match choice["finish_reason"].as_str() {
        Some("length") => {
            return Err(LlmError::Incomplete { reason: "max output tokens reached".to_string() });
        }
        Some("content_filter") => {
            return Err(LlmError::Incomplete { reason: "content filter".to_string() });
        }
        _ => {}
    }
    Ok(LlmResponse {
        content: choice["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: json["model"]
            .as_str()
            .unwrap_or(fallback_model)
            .to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    let retry_after_ms = resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000));
    let text = resp.text().await?;

    if status == 429 {
        return Err(LlmError::RateLimited { retry_after_ms });
    }
    if status >= 400 {
        let body: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let msg = body["error"]["message"]
            .as_str()
            .or_else(|| body["message"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| text.chars().take(200).collect());
        return Err(LlmError::ApiError { status, message: msg });
    }
    Ok(serde_json::from_str(&text)?)
}

fn openai_body(req: &LlmRequest, default_model: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model":       req.model.as_deref().unwrap_or(default_model),
        "messages":    req.messages,
        "max_tokens":  req.max_tokens.unwrap_or(2000),
        "temperature": req.temperature.unwrap_or(0.2),
    });
    if req.json_mode {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    body
}

// ── 1. OpenAI ─────────────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    pub model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = openai_body(&req, &self.model);
        let resp = self.client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_response_status(resp).await?;
        parse_openai_response(&json, &self.model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn backend_name(&self) -> &str { "openai" }
    fn is_local(&self) -> bool { false }
}

// ── 2. OpenAI-Compatible (Ollama, LMStudio, vLLM, Groq, OpenRouter, …) ──────

pub struct OpenAiCompatibleBackend {
    pub base_url: String,
    pub model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

/// Server root with any trailing `/` or `/v1` removed, so both
/// `http://host:11434` and `http://host:11434/v1` address the same API.
fn api_root(base_url: &str) -> &str {
    let trimmed = base_url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed)
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k),
            None    => req,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", api_root(&self.base_url));
        let body = openai_body(&req, &self.model);
        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;
        let json = check_response_status(resp).await?;
        parse_openai_response(&json, &self.model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn backend_name(&self) -> &str { "openai_compatible" }
    fn is_local(&self) -> bool {
        self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1")
    }
}

// ── 3. Anthropic (claude-*) ───────────────────────────────────────────────────

pub struct AnthropicBackend {
    pub model: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), model: model.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        // Anthropic Messages API: split system prompt from user messages
        let system = req.system_prompt();

        let messages: Vec<serde_json::Value> = req.messages.iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let model = req.model.as_deref().unwrap_or(&self.model);

        let mut body = serde_json::json!({
            "model":       model,
            "messages":    messages,
            "max_tokens":  req.max_tokens.unwrap_or(2000),
            "temperature": req.temperature.unwrap_or(0.2),
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        let resp = self.client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let json = check_response_status(resp).await?;

        if json["stop_reason"].as_str() == Some("max_tokens") {
            return Err(LlmError::Incomplete { reason: "max output tokens reached".to_string() });
        }

        let content = json["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|b| b["text"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(LlmResponse {
            content,
            model: json["model"].as_str().unwrap_or(model).to_string(),
            prompt_tokens:     json["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn model_id(&self) -> &str { &self.model }
    fn backend_name(&self) -> &str { "anthropic" }
    fn is_local(&self) -> bool { false }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_backend_is_not_local() {
        let b = OpenAiBackend::new("sk-test", "gpt-4o-mini");
        assert!(!b.is_local());
        assert_eq!(b.model_id(), "gpt-4o-mini");
    }

    #[test]
    fn test_compatible_backend_local_detection() {
        let b = OpenAiCompatibleBackend::new("http://localhost:11434", "llama3:8b", None);
        assert!(b.is_local());
        let remote = OpenAiCompatibleBackend::new("https://api.groq.com/openai", "llama3-70b", None);
        assert!(!remote.is_local());
    }

    #[test]
    fn test_api_root_accepts_v1_suffix() {
        assert_eq!(api_root("http://localhost:11434"), "http://localhost:11434");
        assert_eq!(api_root("http://localhost:11434/"), "http://localhost:11434");
        assert_eq!(api_root("http://localhost:11434/v1"), "http://localhost:11434");
        assert_eq!(api_root("http://localhost:11434/v1/"), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_fatal() {
        let err = reqwest::Client::new().post("not a url").send().await.unwrap_err();
        assert!(!LlmError::Http(err).is_transient());
    }

    #[test]
    fn test_error_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(LlmError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(LlmError::ApiError { status: 503, message: "overloaded".into() }.is_transient());
        assert!(LlmError::ApiError { status: 408, message: "timeout".into() }.is_transient());
        assert!(!LlmError::ApiError { status: 401, message: "bad key".into() }.is_transient());
        assert!(!LlmError::ApiError { status: 400, message: "bad request".into() }.is_transient());
        assert!(!LlmError::Incomplete { reason: "content filter".into() }.is_transient());
    }

    #[test]
    fn test_json_mode_sets_response_format() {
        let req = LlmRequest {
            messages: vec![Message::system("sys"), Message::user("hi")],
            model: None,
            max_tokens: Some(100),
            temperature: None,
            json_mode: true,
        };
        let body = openai_body(&req, "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(req.system_prompt(), "sys");
        assert_eq!(req.user_prompt(), "hi");
    }

    #[test]
    fn test_truncated_completion_is_incomplete() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "{\"a\":" }, "finish_reason": "length" }]
        });
        let err = parse_openai_response(&json, "m").unwrap_err();
        assert!(matches!(err, LlmError::Incomplete { .. }));
    }
}
