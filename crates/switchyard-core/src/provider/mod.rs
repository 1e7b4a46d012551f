//! LLM provider trait and the set of configured provider clients.
//!
//! The `openai` module provides an OpenAI-compatible implementation that
//! covers most vendors (OpenRouter, Groq, DeepSeek, Gemini, vLLM, ...).
//! Model choice and failover live in [`crate::router`], not here: a provider
//! makes exactly one HTTP call per `complete` and classifies the outcome.

pub mod openai;
pub mod types;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorKind, ProviderError};
use types::{ChatMessage, LlmResponse, ToolDefinition};

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one chat completion request with `tool_choice = auto`.
    ///
    /// # Arguments
    /// * `messages` - Conversation so far
    /// * `tools` - Available tool definitions (empty = no tool calling)
    /// * `model` - Model identifier to call
    /// * `max_tokens` - Maximum response tokens
    /// * `temperature` - Sampling temperature
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmResponse, ProviderError>;
}

/// Provider clients keyed by provider name (`"groq"`, `"openrouter"`, ...).
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    /// Look up the client for a provider, failing with `ModelUnavailable`
    /// when nothing is configured for it.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.providers.get(name).cloned().ok_or_else(|| {
            ProviderError::new(
                ErrorKind::ModelUnavailable,
                format!("no client configured for provider '{}'", name),
            )
        })
    }
}
