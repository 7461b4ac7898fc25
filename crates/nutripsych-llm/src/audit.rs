//! Audit records for completion calls.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionAudit {
    pub id: Uuid,
    pub task: String,
    pub model: String,
    pub backend: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub output_hash: String,
    pub latency_ms: u64,
    pub attempt: u32,
    pub called_at: chrono::DateTime<Utc>,
}

impl CompletionAudit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: String,
        model: String,
        backend: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        output: &str,
        latency_ms: u64,
        attempt: u32,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(output.as_bytes());
        let output_hash = format!("{:x}", hasher.finalize());

        Self {
            id: Uuid::new_v4(),
            task,
            model,
            backend,
            prompt_tokens,
            completion_tokens,
            output_hash,
            latency_ms,
            attempt,
            called_at: Utc::now(),
        }
    }

    pub fn log(&self) {
        tracing::debug!(
            audit_id = %self.id,
            task = %self.task,
            model = %self.model,
            backend = %self.backend,
            prompt_tokens = self.prompt_tokens,
            completion_tokens = self.completion_tokens,
            output_hash = %self.output_hash,
            latency_ms = self.latency_ms,
            attempt = self.attempt,
            "Completion response"
        );
    }
}
