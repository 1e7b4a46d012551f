//! The single wire format handed back to callers.
//!
//! Every orchestration run ends in exactly one [`ApiResponse`]. The
//! [`ResponseBuilder`] is created when a run starts, collects the tools that
//! ran and the model that answered, and stamps execution time on whichever
//! terminal constructor is called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;

/// Used when a rate-limit error arrives without any hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    PartialSuccess,
    Processing,
}

/// One executed tool call, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub name: String,
    pub args: Value,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Seconds; only present for rate limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// Result of processing one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(default)]
    tools_used: Vec<ToolUsage>,
    /// Seconds.
    execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_info: Option<ModelInfo>,
    timestamp: DateTime<Utc>,
}

impl ApiResponse {
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorBody> {
        self.error.as_ref()
    }

    pub fn error_code(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn tools_used(&self) -> &[ToolUsage] {
        &self.tools_used
    }

    pub fn execution_time(&self) -> f64 {
        self.execution_time
    }

    pub fn model_info(&self) -> Option<&ModelInfo> {
        self.model_info.as_ref()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Accumulates per-run metadata and produces the terminal response.
#[derive(Debug)]
pub struct ResponseBuilder {
    started: Instant,
    tools_used: Vec<ToolUsage>,
    model: Option<ModelInfo>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::start()
    }
}

impl ResponseBuilder {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            tools_used: Vec::new(),
            model: None,
        }
    }

    /// Remember the model that produced the latest reply.
    pub fn set_model(&mut self, model_id: &str, provider: &str) {
        self.model = Some(ModelInfo {
            model_id: model_id.to_string(),
            provider: provider.to_string(),
        });
    }

    pub fn record_tool(&mut self, name: &str, args: Value, result: &str) {
        self.tools_used.push(ToolUsage {
            name: name.to_string(),
            args,
            result: result.to_string(),
        });
    }

    pub fn tools_used(&self) -> &[ToolUsage] {
        &self.tools_used
    }

    fn finish(self, status: Status) -> ApiResponse {
        ApiResponse {
            status,
            response: None,
            data: None,
            error: None,
            execution_time: self.started.elapsed().as_secs_f64(),
            tools_used: self.tools_used,
            model_info: self.model,
            timestamp: Utc::now(),
        }
    }

    pub fn success(self, response: impl Into<String>) -> ApiResponse {
        ApiResponse {
            response: Some(response.into()),
            ..self.finish(Status::Success)
        }
    }

    /// Terminal failure. An empty `message` is replaced by the kind's
    /// default text; `retry_after` is only kept for rate limits.
    pub fn error(
        self,
        kind: ErrorKind,
        message: &str,
        retry_after: Option<Duration>,
        details: Option<Value>,
    ) -> ApiResponse {
        let message = if message.trim().is_empty() {
            kind.default_message().to_string()
        } else {
            message.to_string()
        };

        let retry_after = (kind == ErrorKind::RateLimitExceeded).then(|| {
            retry_after
                .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                .max(1)
        });

        let body = ErrorBody {
            code: kind,
            message,
            retryable: kind.is_retryable(),
            retry_after,
            details,
            suggestions: kind.suggestions(),
        };

        ApiResponse {
            error: Some(body),
            model_info: None,
            ..self.finish(Status::Error)
        }
    }

    /// The run was cut short after doing useful work.
    pub fn partial(self, response: impl Into<String>, reason: ErrorKind, message: &str) -> ApiResponse {
        let message = if message.is_empty() {
            reason.default_message()
        } else {
            message
        };
        let data = serde_json::json!({ "reason": reason, "message": message });
        ApiResponse {
            response: Some(response.into()),
            data: Some(data),
            ..self.finish(Status::PartialSuccess)
        }
    }

    /// Acknowledge a request that is still running elsewhere.
    pub fn processing(self, data: Value) -> ApiResponse {
        ApiResponse {
            data: Some(data),
            ..self.finish(Status::Processing)
        }
    }
}
