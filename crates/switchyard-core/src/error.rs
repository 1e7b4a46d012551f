//! Error taxonomy shared by the provider layer, the tool executor, the
//! router and the response builder.
//!
//! [`ErrorKind`] is the machine-readable code that ends up on the wire.
//! The concrete error types ([`ProviderError`], [`ToolError`]) each carry
//! one and know how to describe themselves to a human.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimitExceeded,
    AuthenticationError,
    InvalidRequest,
    ModelUnavailable,
    EmptyResponse,
    InvalidResponse,
    ToolExecutionError,
    CommandNotAllowed,
    PathNotAllowed,
    MaxIterationsReached,
    Timeout,
    Cancelled,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ModelUnavailable => "MODEL_UNAVAILABLE",
            Self::EmptyResponse => "EMPTY_RESPONSE",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::ToolExecutionError => "TOOL_EXECUTION_ERROR",
            Self::CommandNotAllowed => "COMMAND_NOT_ALLOWED",
            Self::PathNotAllowed => "PATH_NOT_ALLOWED",
            Self::MaxIterationsReached => "MAX_ITERATIONS_REACHED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded
                | Self::ModelUnavailable
                | Self::EmptyResponse
                | Self::InvalidResponse
                | Self::Timeout
        )
    }

    /// Whether the orchestrator should immediately try a different model.
    pub fn retry_on_other_model(&self) -> bool {
        matches!(self, Self::RateLimitExceeded | Self::ModelUnavailable)
    }

    /// Whether one more attempt (on any model) is worth making.
    pub fn retry_once(&self) -> bool {
        matches!(self, Self::EmptyResponse | Self::InvalidResponse)
    }

    /// Human message used when no more specific one is available.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "The model provider is rate limiting requests.",
            Self::AuthenticationError => "The model provider rejected the configured credentials.",
            Self::InvalidRequest => "The request was rejected as malformed.",
            Self::ModelUnavailable => "The selected model is currently unavailable.",
            Self::EmptyResponse => "The model returned an empty response.",
            Self::InvalidResponse => "The model returned a response that could not be understood.",
            Self::ToolExecutionError => "A tool failed while executing.",
            Self::CommandNotAllowed => "The command is not permitted by the execution policy.",
            Self::PathNotAllowed => "The path is outside the allowed directory.",
            Self::MaxIterationsReached => "The tool-call limit for this request was reached.",
            Self::Timeout => "The request did not finish in time.",
            Self::Cancelled => "The request was cancelled.",
            Self::InternalError => "An internal error occurred.",
        }
    }

    /// Remediation hints shown alongside an error response.
    pub fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            Self::RateLimitExceeded => &[
                "Wait for the retry_after interval before resubmitting.",
                "Pick a different model with `model_id`.",
            ],
            Self::AuthenticationError => &[
                "Check the provider API key in config.json.",
                "Make sure the key has access to the requested model.",
            ],
            Self::InvalidRequest => &["Shorten or rephrase the message and try again."],
            Self::ModelUnavailable => &[
                "Retry with a different model.",
                "Check the provider status page.",
            ],
            Self::EmptyResponse | Self::InvalidResponse => &["Retry the request once."],
            Self::ToolExecutionError => &["Inspect the tool output in tools_used."],
            Self::CommandNotAllowed => &["Only allow-listed commands can be executed."],
            Self::PathNotAllowed => &["Use a path inside the workspace directory."],
            Self::MaxIterationsReached => &[
                "Break the task into smaller requests.",
                "Increase agents.defaults.maxToolIterations.",
            ],
            Self::Timeout => &[
                "Retry the request.",
                "Increase agents.defaults.requestTimeoutSeconds.",
            ],
            Self::Cancelled => &[],
            Self::InternalError => &["Check the logs for details."],
        };
        hints.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Provider errors ─────────────────────────────────────────────────

/// A failed model call, already classified.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-supplied hint (e.g. a `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimitExceeded,
            message: message.into(),
            retry_after,
        }
    }
}

// ── Tool errors ─────────────────────────────────────────────────────

/// Failure of a single tool invocation. Never fatal to a run.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    CommandNotAllowed(String),

    #[error("{0}")]
    PathNotAllowed(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CommandNotAllowed(_) => ErrorKind::CommandNotAllowed,
            Self::PathNotAllowed(_) => ErrorKind::PathNotAllowed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::UnknownTool(_) | Self::InvalidArguments(_) | Self::Failed(_) => {
                ErrorKind::ToolExecutionError
            }
        }
    }

    /// Text handed back to the model so it can correct itself.
    pub fn to_tool_output(&self) -> String {
        format!("Error [{}]: {}", self.kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        let json = serde_json::to_string(&ErrorKind::MaxIterationsReached).unwrap();
        assert_eq!(json, "\"MAX_ITERATIONS_REACHED\"");
        assert_eq!(ErrorKind::RateLimitExceeded.to_string(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_retry_classification() {
        assert!(ErrorKind::RateLimitExceeded.is_retryable());
        assert!(ErrorKind::RateLimitExceeded.retry_on_other_model());
        assert!(!ErrorKind::AuthenticationError.is_retryable());
        assert!(!ErrorKind::InvalidRequest.retry_on_other_model());
        assert!(ErrorKind::EmptyResponse.retry_once());
        assert!(!ErrorKind::MaxIterationsReached.is_retryable());
    }

    #[test]
    fn test_tool_error_output_is_tagged() {
        let err = ToolError::CommandNotAllowed("'rm' is not in the allow-list".into());
        assert_eq!(err.kind(), ErrorKind::CommandNotAllowed);
        assert_eq!(
            err.to_tool_output(),
            "Error [COMMAND_NOT_ALLOWED]: 'rm' is not in the allow-list"
        );
    }
}
