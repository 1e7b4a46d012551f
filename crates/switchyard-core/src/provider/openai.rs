//! OpenAI-compatible LLM provider.
//!
//! This single implementation covers **all** providers that expose an
//! OpenAI-compatible chat completions endpoint:
//!
//! - OpenAI (`https://api.openai.com/v1`)
//! - OpenRouter (`https://openrouter.ai/api/v1`)
//! - DeepSeek (`https://api.deepseek.com/v1`)
//! - Groq (`https://api.groq.com/openai/v1`)
//! - Gemini (`https://generativelanguage.googleapis.com/v1beta/openai`)
//! - Cerebras (`https://api.cerebras.ai/v1`)
//! - vLLM / any local server
//!
//! The provider makes a single attempt per call and turns every failure
//! into a classified [`ProviderError`]. Retrying on another model is the
//! orchestrator's decision.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{ChatMessage, LlmResponse, ToolCallRequest, ToolDefinition, Usage};
use super::LlmProvider;
use crate::error::{ErrorKind, ProviderError};

/// Known provider base URLs.
const PROVIDER_URLS: &[(&str, &str)] = &[
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("openai", "https://api.openai.com/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    (
        "gemini",
        "https://generativelanguage.googleapis.com/v1beta/openai",
    ),
    ("cerebras", "https://api.cerebras.ai/v1"),
];

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Create a new provider.
    ///
    /// # Arguments
    /// * `provider_name` - Provider identifier (e.g., "openrouter", "groq", "vllm")
    /// * `api_key` - API key for authentication
    /// * `api_base` - Custom base URL (overrides the default for the provider)
    /// * `client` - Shared HTTP client; its timeout bounds every call
    pub fn new(provider_name: &str, api_key: &str, api_base: Option<&str>, client: Client) -> Self {
        let base_url = api_base
            .map(|s| s.to_string())
            .unwrap_or_else(|| default_base_url(provider_name).to_string())
            .trim_end_matches('/')
            .to_string();

        debug!(provider = provider_name, base_url = %base_url, "Initialized LLM provider");

        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
        }
    }
}

/// Base URL for a known provider; unknown names fall back to OpenAI.
pub fn default_base_url(provider_name: &str) -> &'static str {
    PROVIDER_URLS
        .iter()
        .find(|(name, _)| *name == provider_name)
        .map(|(_, url)| *url)
        .unwrap_or("https://api.openai.com/v1")
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::RateLimitExceeded,
        401 | 403 => ErrorKind::AuthenticationError,
        400 | 413 | 422 => ErrorKind::InvalidRequest,
        404 | 500..=599 => ErrorKind::ModelUnavailable,
        408 => ErrorKind::Timeout,
        _ => ErrorKind::InvalidResponse,
    }
}

/// Parse a `Retry-After` header given in whole seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

// ── OpenAI API request/response types ───────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageResponse>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallResponse>>,
}

#[derive(Deserialize)]
struct ToolCallResponse {
    #[serde(default)]
    id: String,
    function: FunctionCallResponse,
}

#[derive(Deserialize)]
struct FunctionCallResponse {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct UsageResponse {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v
                .first()
                .map(|b| b.error.message.clone())
                .unwrap_or_else(|| "Unknown error".into()),
        }
    }
}

/// Turn a successful response body into an [`LlmResponse`].
fn parse_completion(body: &str) -> Result<LlmResponse, ProviderError> {
    let completion: CompletionResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::new(
            ErrorKind::InvalidResponse,
            format!("failed to parse completion: {}", e),
        )
    })?;

    let choice = completion.choices.into_iter().next().ok_or_else(|| {
        ProviderError::new(ErrorKind::EmptyResponse, "LLM API returned no choices")
    })?;

    let tool_calls: Vec<ToolCallRequest> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallRequest {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    let content = choice.message.content.filter(|c| !c.trim().is_empty());
    if content.is_none() && tool_calls.is_empty() {
        return Err(ProviderError::new(
            ErrorKind::EmptyResponse,
            "LLM API returned neither text nor tool calls",
        ));
    }

    let usage = completion.usage.map_or(Usage::default(), |u| Usage {
        prompt_tokens: u.prompt_tokens.unwrap_or(0),
        completion_tokens: u.completion_tokens.unwrap_or(0),
        total_tokens: u.total_tokens.unwrap_or(0),
    });

    Ok(LlmResponse {
        content,
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
        usage,
    })
}

// ── LlmProvider implementation ──────────────────────────────────────

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let tools_opt = if tools.is_empty() { None } else { Some(tools) };

        let request_body = CompletionRequest {
            model,
            messages,
            max_tokens,
            temperature,
            tools: tools_opt,
            tool_choice: tools_opt.map(|_| "auto"),
        };

        debug!(model, url = %url, msg_count = messages.len(), "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                warn!(model, error = %e, "Network error calling LLM API");
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::ModelUnavailable
                };
                ProviderError::new(kind, format!("request failed: {}", e))
            })?;

        let status = response.status();
        let hint = retry_after(response.headers());
        let body = response.text().await.map_err(|e| {
            ProviderError::new(
                ErrorKind::InvalidResponse,
                format!("failed to read response body: {}", e),
            )
        })?;

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.message())
                .unwrap_or(body);
            let kind = classify_status(status);
            warn!(model, status = %status, kind = %kind, "LLM API returned an error");
            return Err(ProviderError {
                kind,
                message: format!("LLM API error ({}): {}", status, err_msg),
                retry_after: hint.filter(|_| kind == ErrorKind::RateLimitExceeded),
            });
        }

        let parsed = parse_completion(&body)?;

        debug!(
            finish_reason = parsed.finish_reason.as_str(),
            tool_calls = parsed.tool_calls.len(),
            tokens = parsed.usage.total_tokens,
            "Received LLM response"
        );

        Ok(parsed)
    }
}
