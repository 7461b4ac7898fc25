//! nutripsych-llm: Completion service abstraction.
//! Backends behind the `LlmBackend` trait, and the retrying
//! `CompletionClient` the enrichment pipeline talks to.

pub mod audit;
pub mod backend;
pub mod client;
pub mod mock;

pub use backend::{LlmBackend, LlmError, LlmRequest, LlmResponse, Message};
pub use client::{CompletionClient, CompletionOptions, RetryPolicy, ServiceError};
