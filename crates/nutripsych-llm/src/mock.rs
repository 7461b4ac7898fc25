//! Mock LLM backend for testing.
//!
//! Replies come from, in order: the scripted queue, the responder closure,
//! then the fixed default response.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{LlmBackend, LlmError, LlmRequest, LlmResponse};

pub type Responder = Arc<dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync>;

pub struct MockBackend {
    model_id: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    responder: Option<Responder>,
    response_content: String,
    call_count: AtomicU32,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            response_content: "{}".to_string(),
            call_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fixed reply once the script is drained.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }

    /// Replies computed from the request (e.g. keyed on the prompt text).
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    /// Queue replies consumed one per call before any other source.
    pub fn with_script(self, replies: Vec<Result<String, LlmError>>) -> Self {
        if let Ok(mut q) = self.script.lock() {
            q.extend(replies);
        }
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(req.clone());
        }

        let scripted = self.script.lock().ok().and_then(|mut q| q.pop_front());
        let content = match scripted {
            Some(reply) => reply?,
            None => match &self.responder {
                Some(f) => f(&req)?,
                None => self.response_content.clone(),
            },
        };

        Ok(LlmResponse {
            completion_tokens: (content.len() / 4) as u32,
            prompt_tokens: req.messages.iter().map(|m| m.content.len() / 4).sum::<usize>() as u32,
            content,
            model: self.model_id.clone(),
        })
    }

    fn model_id(&self) -> &str { &self.model_id }
    fn backend_name(&self) -> &str { "mock" }
    fn is_local(&self) -> bool { true }
}
