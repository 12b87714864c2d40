//! Inference service integration.
//!
//! The agent only needs plain completions with an optional JSON hint, so the
//! seam is a single [`LlmProvider`] trait plus one OpenAI-compatible HTTP
//! implementation.

mod openai_compat;
mod provider;
mod reasoning;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
pub use reasoning::{Reasoning, ThinkContext, ThinkDecision, ToolIntent};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the configured LLM provider.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(model = %config.model, "Using OpenAI-compatible chat completions provider");
    Ok(Arc::new(OpenAiCompatProvider::new(config.clone())?))
}
