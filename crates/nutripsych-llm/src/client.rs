//! Completion client: one prompt pair in, raw completion text out.
//!
//! Wraps an [`LlmBackend`] with the per-call deadline, request pacing and
//! the retry policy. Retrying is an explicit state machine ([`RetryState`])
//! so the policy can be tested without a network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::audit::CompletionAudit;
use crate::backend::{LlmBackend, LlmError, LlmRequest, Message};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The last transient failure. `exhausted` is false only when retrying
    /// stopped early because of shutdown.
    #[error("transient completion error after {attempts} attempt(s) (exhausted: {exhausted}): {last}")]
    Transient { last: LlmError, attempts: u32, exhausted: bool },

    #[error("fatal completion error: {0}")]
    Fatal(LlmError),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Per-call completion options.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Free-form label used in logs and audit records (usually the task type).
    pub label: String,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Deadline for a single attempt, not for the whole retry sequence.
    pub timeout: Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            label: "completion".to_string(),
            model: None,
            max_tokens: 2000,
            temperature: 0.2,
            timeout: Duration::from_secs(60),
        }
    }
}

// ── Retry state machine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `next_attempt`.
    Retry { next_attempt: u32, delay: Duration },
    GiveUp,
}

/// Attempt count and next backoff delay, advanced once per failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self { attempts: 0, next_delay: policy.base_delay }
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn on_failure(&mut self, policy: &RetryPolicy, err: &LlmError) -> RetryDecision {
        if !err.is_transient() || self.attempts >= policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        let mut delay = self.next_delay;
        if let LlmError::RateLimited { retry_after_ms: Some(ms) } = err {
            delay = delay.max(Duration::from_millis(*ms));
        }
        let delay = delay.min(policy.max_delay);
        self.next_delay = Duration::try_from_secs_f64(self.next_delay.as_secs_f64() * policy.multiplier)
            .unwrap_or(policy.max_delay)
            .min(policy.max_delay);
        RetryDecision::Retry { next_attempt: self.attempts + 1, delay }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct CompletionClient {
    backend: Arc<dyn LlmBackend>,
    policy: RetryPolicy,
    /// Minimum spacing between consecutive requests across all tasks.
    rate_limit_delay: Duration,
    last_request: Mutex<Option<Instant>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn LlmBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            rate_limit_delay: Duration::ZERO,
            last_request: Mutex::new(None),
            shutdown: None,
        }
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// Stop scheduling retries once the signal flips to `true`.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn policy(&self) -> &RetryPolicy { &self.policy }

    pub fn model_id(&self) -> &str { self.backend.model_id() }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    async fn pace(&self) {
        if self.rate_limit_delay.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.rate_limit_delay {
                tokio::time::sleep(self.rate_limit_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Send one rendered prompt pair and return the raw completion text.
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<String, ServiceError> {
        let req = LlmRequest {
            messages: vec![Message::system(system_prompt), Message::user(user_prompt)],
            model: opts.model.clone(),
            max_tokens: Some(opts.max_tokens),
            temperature: Some(opts.temperature),
            json_mode: true,
        };
        let model = opts.model.as_deref().unwrap_or(self.backend.model_id()).to_string();
        let mut state = RetryState::new(&self.policy);

        loop {
            let attempt = state.begin_attempt();
            self.pace().await;
            debug!(
                task = %opts.label,
                model = %model,
                attempt,
                temperature = opts.temperature,
                "Completion request"
            );

            let started = Instant::now();
            let result = match tokio::time::timeout(opts.timeout, self.backend.complete(req.clone())).await {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout(opts.timeout)),
            };

            let err = match result {
                Ok(resp) => {
                    CompletionAudit::new(
                        opts.label.clone(),
                        resp.model.clone(),
                        self.backend.backend_name().to_string(),
                        resp.prompt_tokens,
                        resp.completion_tokens,
                        &resp.content,
                        started.elapsed().as_millis() as u64,
                        attempt,
                    )
                    .log();
                    return Ok(resp.content);
                }
                Err(e) => e,
            };

            warn!(
                task = %opts.label,
                model = %model,
                attempt,
                transient = err.is_transient(),
                error = %err,
                "Completion attempt failed"
            );

            match state.on_failure(&self.policy, &err) {
                RetryDecision::Retry { delay, next_attempt } => {
                    if self.shutting_down() {
                        return Err(ServiceError::Transient { last: err, attempts: attempt, exhausted: false });
                    }
                    debug!(task = %opts.label, next_attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp if err.is_transient() => {
                    return Err(ServiceError::Transient { last: err, attempts: attempt, exhausted: true });
                }
                RetryDecision::GiveUp => return Err(ServiceError::Fatal(err)),
            }
        }
    }
}
