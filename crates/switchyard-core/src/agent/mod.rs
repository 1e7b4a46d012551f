//! Orchestrator: the multi-turn tool-calling loop.
//!
//! One call to [`Orchestrator::process`] is one orchestration run:
//! 1. Builds context (system prompt + history + current message)
//! 2. Asks the router for a model and calls it
//! 3. If the model returns tool calls, executes them, appends the results
//!    and calls the model again
//! 4. A plain-text reply ends the run with `success`; running out of
//!    iterations, time or retries ends it with `error` (or
//!    `partial_success` when tools already did work)
//!
//! The message list is owned by the run. The only shared state touched is
//! the router's usage ledger and preference store.

pub mod context;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorKind, ProviderError};
use crate::provider::types::{
    ChatMessage, FunctionCall, LlmResponse, ToolCallMessage, ToolCallRequest, ToolDefinition,
};
use crate::provider::ProviderSet;
use crate::response::{ApiResponse, ResponseBuilder};
use crate::router::{ProviderRouter, RouterError};
use crate::tools::{ToolExecutor, ToolInvocation, ToolResult};
use context::ContextBuilder;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Model calls allowed per run, retries included, before giving up
    /// with MaxIterationsReached.
    pub max_iterations: u32,
    /// Attempts allowed within one iteration when calls fail retryably.
    pub max_model_attempts: u32,
    pub request_timeout: Duration,
    pub system_prompt: Option<String>,
    pub workspace: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            max_iterations: 5,
            max_model_attempts: 3,
            request_timeout: Duration::from_secs(180),
            system_prompt: None,
            workspace: PathBuf::from("."),
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        let d = &config.agents.defaults;
        Self {
            max_tokens: d.max_tokens,
            temperature: d.temperature,
            max_iterations: d.max_tool_iterations.max(1),
            max_model_attempts: d.max_model_attempts.max(1),
            request_timeout: Duration::from_secs(d.request_timeout_seconds.max(1)),
            system_prompt: d.system_prompt.clone(),
            workspace: config.workspace_path(),
        }
    }
}

/// Inbound request as a host application submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub message: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Why a run stopped before the model produced a final answer.
struct Interrupted {
    kind: ErrorKind,
    message: String,
}

/// Per-run bookkeeping.
struct Run {
    messages: Vec<ChatMessage>,
    builder: ResponseBuilder,
    seen_ids: HashSet<String>,
    calls_seen: usize,
    /// Provider calls made so far, retries included.
    model_calls: u32,
    /// Text the model sent alongside its latest tool calls.
    last_text: Option<String>,
    deadline: Instant,
}

impl Run {
    /// Unique id for a tool call, synthesising one when the model gave none.
    fn assign_id(&mut self, raw: &str) -> String {
        self.calls_seen += 1;
        let base = match raw.trim() {
            "" => format!("call_{}", self.calls_seen),
            id => id.to_string(),
        };
        let mut id = base.clone();
        let mut n = 1;
        while !self.seen_ids.insert(id.clone()) {
            n += 1;
            id = format!("{}_{}", base, n);
        }
        id
    }
}

pub struct Orchestrator {
    router: Arc<ProviderRouter>,
    providers: ProviderSet,
    executor: ToolExecutor,
    config: AgentConfig,
}

impl Orchestrator {
    pub fn new(
        router: Arc<ProviderRouter>,
        providers: ProviderSet,
        executor: ToolExecutor,
        config: AgentConfig,
    ) -> Self {
        Self {
            router,
            providers,
            executor,
            config,
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Process one user message against `history` and return the response.
    pub async fn process(
        &self,
        message: &str,
        history: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> ApiResponse {
        self.process_with_cancel(message, history, model_hint, &CancellationToken::new())
            .await
    }

    /// Entry point for host applications submitting a [`ProcessRequest`].
    pub async fn handle(
        &self,
        request: &ProcessRequest,
        history: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ApiResponse {
        let session = request.session_id.as_deref().unwrap_or("-");
        info!(session, history = history.len(), "Handling request");
        let response = self
            .process_with_cancel(&request.message, history, request.model_id.as_deref(), cancel)
            .await;
        info!(session, status = ?response.status(), "Request finished");
        response
    }

    /// Like [`process`](Self::process), stopping early once `cancel` fires.
    /// A tool call already in flight finishes on its own timeout.
    pub async fn process_with_cancel(
        &self,
        message: &str,
        history: &[ChatMessage],
        model_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> ApiResponse {
        let builder = ResponseBuilder::start();

        if message.trim().is_empty() {
            return builder.error(ErrorKind::InvalidRequest, "The message is empty.", None, None);
        }

        let ctx = ContextBuilder::new(
            &self.config.workspace,
            self.executor.registry(),
            self.config.system_prompt.as_deref(),
        );
        let mut run = Run {
            messages: ctx.build_messages(history, message),
            builder,
            seen_ids: HashSet::new(),
            calls_seen: 0,
            model_calls: 0,
            last_text: None,
            deadline: Instant::now() + self.config.request_timeout,
        };
        let definitions = self.executor.registry().definitions();
        let max_iterations = self.config.max_iterations;

        info!(
            history = history.len(),
            hint = model_hint.unwrap_or("-"),
            "Processing user message"
        );

        let mut iteration = 0u32;
        while run.model_calls < max_iterations {
            iteration += 1;
            if let Some(stop) = self.check_interrupt(&run, cancel) {
                return self.finish_interrupted(run, stop);
            }

            debug!(iteration, msg_count = run.messages.len(), "Calling model");

            let reply = match self
                .call_model(&mut run, &definitions, model_hint, cancel)
                .await
            {
                Ok(reply) => reply,
                Err(e) if e.kind == ErrorKind::MaxIterationsReached => break,
                Err(e) if matches!(e.kind, ErrorKind::Timeout | ErrorKind::Cancelled) => {
                    let stop = Interrupted {
                        kind: e.kind,
                        message: e.message,
                    };
                    return self.finish_interrupted(run, stop);
                }
                Err(e) => {
                    warn!(kind = %e.kind, error = %e.message, "Model call failed, ending run");
                    return run.builder.error(e.kind, &e.message, e.retry_after, None);
                }
            };

            if reply.tool_calls.is_empty() {
                let text = reply.content.unwrap_or_default();
                info!(
                    iterations = iteration,
                    tools = run.builder.tools_used().len(),
                    tokens = reply.usage.total_tokens,
                    "Response complete"
                );
                return run.builder.success(text);
            }

            self.run_tool_calls(&mut run, reply).await;
        }

        warn!(model_calls = run.model_calls, "Hit max tool iterations, stopping");
        let message = format!(
            "Stopped after {} model calls without a final answer.",
            max_iterations
        );
        let details = serde_json::json!({ "max_iterations": max_iterations });
        run.builder
            .error(ErrorKind::MaxIterationsReached, &message, None, Some(details))
    }

    fn check_interrupt(&self, run: &Run, cancel: &CancellationToken) -> Option<Interrupted> {
        if cancel.is_cancelled() {
            return Some(Interrupted {
                kind: ErrorKind::Cancelled,
                message: "The request was cancelled.".into(),
            });
        }
        if Instant::now() >= run.deadline {
            return Some(Interrupted {
                kind: ErrorKind::Timeout,
                message: format!(
                    "The request exceeded its {} second deadline.",
                    self.config.request_timeout.as_secs()
                ),
            });
        }
        None
    }

    /// Stopped by deadline or cancellation: partial when tools already ran.
    fn finish_interrupted(&self, run: Run, stop: Interrupted) -> ApiResponse {
        let tools_run = run.builder.tools_used().len();
        warn!(kind = %stop.kind, tools_run, "Run interrupted");

        if tools_run == 0 {
            return run.builder.error(stop.kind, &stop.message, None, None);
        }

        let text = run
            .last_text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "Stopped before a final answer after running {} tool call(s); see tools_used.",
                    tools_run
                )
            });
        run.builder.partial(text, stop.kind, &stop.message)
    }

    /// One model call with bounded retry.
    ///
    /// Rate limits and unavailable models are recorded on the router and
    /// retried on whatever it selects next; an empty or unreadable reply is
    /// retried once. Everything else is returned to the caller. Every call
    /// counts against the run's `max_iterations`; when that is used up
    /// mid-retry the last failure is returned, or MaxIterationsReached if
    /// there was none.
    async fn call_model(
        &self,
        run: &mut Run,
        tools: &[ToolDefinition],
        model_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let mut hint = model_hint;
        let mut retried_once = false;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=self.config.max_model_attempts {
            if run.model_calls >= self.config.max_iterations {
                return Err(last_error.unwrap_or_else(|| {
                    ProviderError::new(ErrorKind::MaxIterationsReached, "Model call budget used up.")
                }));
            }

            let selection = self.router.select(hint).map_err(|e| match &e {
                RouterError::RateLimited { retry_after } => {
                    ProviderError::rate_limited(e.to_string(), Some(*retry_after))
                }
                _ => ProviderError::new(ErrorKind::ModelUnavailable, e.to_string()),
            })?;
            let model = selection.model;
            if let Some(wait) = selection.degraded {
                warn!(model = %model.id, wait_secs = wait.as_secs(), "Using a blacklisted model");
            }

            let provider = match self.providers.get(&model.provider) {
                Ok(p) => p,
                Err(e) => {
                    warn!(model = %model.id, provider = %model.provider, "No client for provider");
                    self.router.record_failure(&model.id, e.kind, None);
                    last_error = Some(e);
                    hint = None;
                    continue;
                }
            };

            let remaining = run.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.router.record_failure(&model.id, ErrorKind::Timeout, None);
                return Err(ProviderError::new(
                    ErrorKind::Timeout,
                    "The request deadline passed before the model could be called.",
                ));
            }

            run.model_calls += 1;
            debug!(model = %model.id, provider = %model.provider, attempt, "Sending completion request");

            let call = provider.complete(
                &run.messages,
                tools,
                &model.id,
                self.config.max_tokens,
                self.config.temperature,
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.router.record_failure(&model.id, ErrorKind::Cancelled, None);
                    return Err(ProviderError::new(ErrorKind::Cancelled, "The request was cancelled."));
                }
                result = tokio::time::timeout(remaining, call) => match result {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::new(
                        ErrorKind::Timeout,
                        format!("Model '{}' did not answer before the request deadline.", model.id),
                    )),
                },
            };

            let outcome = outcome.and_then(|reply| {
                let blank = reply.content.as_deref().map_or(true, |c| c.trim().is_empty());
                if reply.tool_calls.is_empty() && blank {
                    Err(ProviderError::new(
                        ErrorKind::EmptyResponse,
                        format!("Model '{}' returned neither text nor tool calls.", model.id),
                    ))
                } else {
                    Ok(reply)
                }
            });

            match outcome {
                Ok(reply) => {
                    self.router
                        .record(&model.id, u64::from(reply.usage.total_tokens));
                    run.builder.set_model(&model.id, &model.provider);
                    return Ok(reply);
                }
                Err(e) => {
                    self.router.record_failure(&model.id, e.kind, e.retry_after);
                    warn!(model = %model.id, kind = %e.kind, attempt, error = %e.message, "Model call failed");

                    if e.kind.retry_on_other_model() {
                        hint = None;
                    } else if e.kind.retry_once() && !retried_once {
                        retried_once = true;
                    } else {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::new(ErrorKind::ModelUnavailable, "No model could be reached.")
        }))
    }

    /// Append the assistant turn and one tool turn per call.
    async fn run_tool_calls(&self, run: &mut Run, reply: LlmResponse) {
        let calls: Vec<ToolCallRequest> = reply
            .tool_calls
            .into_iter()
            .map(|tc| {
                let id = run.assign_id(&tc.id);
                ToolCallRequest {
                    id,
                    name: tc.name,
                    arguments: tc.arguments,
                }
            })
            .collect();

        let call_messages: Vec<ToolCallMessage> = calls
            .iter()
            .map(|tc| ToolCallMessage {
                id: tc.id.clone(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: tc.name.clone(),
                    arguments: if tc.arguments.trim().is_empty() {
                        "{}".into()
                    } else {
                        tc.arguments.clone()
                    },
                },
            })
            .collect();

        run.last_text = reply.content.clone();
        run.messages.push(ChatMessage::assistant_with_tool_calls(
            reply.content.as_deref(),
            call_messages,
        ));

        for call in &calls {
            let (result, args) = match ToolInvocation::parse(&call.id, &call.name, &call.arguments) {
                Ok(invocation) => {
                    let args = Value::Object(
                        invocation
                            .parsed_arguments
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    );
                    (self.executor.run(&invocation).await, args)
                }
                Err(e) => {
                    debug!(tool = %call.name, error = %e, "Malformed tool arguments");
                    (
                        ToolResult::failure(&call.id, &call.name, &e),
                        Value::String(call.arguments.clone()),
                    )
                }
            };

            debug!(
                tool = %result.tool_name,
                ok = result.ok,
                result_len = result.output.len(),
                "Tool call complete"
            );

            run.messages.push(ChatMessage::tool_result(
                &result.invocation_id,
                &result.tool_name,
                &result.output,
            ));
            run.builder.record_tool(&result.tool_name, args, &result.output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::Role;
    use crate::provider::LlmProvider;
    use crate::response::Status;
    use crate::router::ledger::UsageLedger;
    use crate::router::state::{RouterState, StateStore};
    use crate::router::ModelDescriptor;
    use crate::tools::filesystem::{FileLimits, FileSandbox, ReadFileTool, WriteFileTool};
    use crate::tools::shell::{CommandPolicy, TerminalTool};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Step {
        Reply(LlmResponse),
        Fail(ProviderError),
        Stall(Duration),
    }

    /// Plays back a fixed script, then repeats `fallback` forever.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Step>>,
        fallback: Option<Step>,
        calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Self::with_fallback(script, None)
        }

        fn with_fallback(script: Vec<Step>, fallback: Option<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn models_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        fn messages_of_call(&self, n: usize) -> Vec<ChatMessage> {
            self.calls.lock().unwrap()[n].1.clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            model: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<LlmResponse, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.fallback.clone());
            match step {
                Some(Step::Reply(r)) => Ok(r),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Stall(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(LlmResponse::text("too late"))
                }
                None => Err(ProviderError::new(ErrorKind::InvalidResponse, "script exhausted")),
            }
        }
    }

    fn tool_call(id: &str, name: &str, args: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn catalog() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("m1", "mock", 30, 1_000_000, 1_000, 90),
            ModelDescriptor::new("m2", "mock", 30, 1_000_000, 1_000, 50),
        ]
    }

    fn orchestrator_with(
        dir: &Path,
        catalog: Vec<ModelDescriptor>,
        provider: Arc<ScriptedProvider>,
        config: AgentConfig,
    ) -> Orchestrator {
        let sandbox = Arc::new(FileSandbox::new(&dir.join("ws"), FileLimits::default()).unwrap());
        let policy = CommandPolicy::from_config(&Default::default()).unwrap();

        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(TerminalTool::new(policy, Arc::clone(&sandbox))))
            .unwrap();
        registry
            .register(Box::new(ReadFileTool::new(Arc::clone(&sandbox))))
            .unwrap();
        registry
            .register(Box::new(WriteFileTool::new(Arc::clone(&sandbox))))
            .unwrap();

        let head = catalog[0].clone();
        let store = StateStore::new(
            dir.join("state.json"),
            RouterState::new(&head.provider, &head.id),
            Duration::ZERO,
        );
        let router = ProviderRouter::new(catalog, Arc::new(UsageLedger::default()), store);

        let mut providers = ProviderSet::new();
        providers.insert("mock", provider);

        Orchestrator::new(
            Arc::new(router),
            providers,
            ToolExecutor::new(Arc::new(registry)),
            AgentConfig {
                workspace: sandbox.root().to_path_buf(),
                ..config
            },
        )
    }

    fn orchestrator(dir: &Path, provider: Arc<ScriptedProvider>) -> Orchestrator {
        orchestrator_with(dir, catalog(), provider, AgentConfig::default())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_tool_call_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse::with_tool_calls(vec![tool_call(
                "call_a",
                "execute_terminal_command",
                r#"{"command": "ls"}"#,
            )])),
            Step::Reply(LlmResponse::text("The workspace is empty.")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("what's in my workspace?", &[], None).await;

        assert_eq!(resp.status(), Status::Success);
        assert_eq!(resp.response(), Some("The workspace is empty."));
        assert_eq!(resp.tools_used().len(), 1);
        assert_eq!(resp.tools_used()[0].name, "execute_terminal_command");
        assert_eq!(resp.tools_used()[0].args["command"], "ls");
        assert!(resp.tools_used()[0].result.starts_with("[exit code: 0]"));
        assert_eq!(resp.model_info().unwrap().model_id, "m1");

        // The second call sees the assistant tool-call turn and its result.
        let second = provider.messages_of_call(1);
        let n = second.len();
        assert_eq!(second[n - 2].role, Role::Assistant);
        assert_eq!(second[n - 1].role, Role::Tool);
        assert_eq!(second[n - 1].tool_call_id.as_deref(), Some("call_a"));
    }

    #[tokio::test]
    async fn test_rate_limit_moves_to_next_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Fail(ProviderError::rate_limited("429 from upstream", None)),
            Step::Reply(LlmResponse::text("hello")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("hi", &[], None).await;

        assert_eq!(resp.status(), Status::Success);
        assert_eq!(provider.models_called(), vec!["m1", "m2"]);
        assert_eq!(resp.model_info().unwrap().model_id, "m2");
        assert!(!orch.router().is_available("m1"));
        assert!(orch.router().is_available("m2"));
    }

    #[tokio::test]
    async fn test_max_iterations_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::with_fallback(
            Vec::new(),
            Some(Step::Reply(LlmResponse::with_tool_calls(vec![tool_call(
                "",
                "read_file",
                r#"{"path": "notes.txt"}"#,
            )]))),
        );
        let config = AgentConfig {
            max_iterations: 2,
            ..AgentConfig::default()
        };
        let orch = orchestrator_with(dir.path(), catalog(), Arc::clone(&provider), config);

        let resp = orch.process("loop forever", &[], None).await;

        assert_eq!(resp.status(), Status::Error);
        assert_eq!(resp.error_code(), Some(ErrorKind::MaxIterationsReached));
        assert_eq!(provider.models_called().len(), 2);
        assert_eq!(resp.tools_used().len(), 2);
        assert!(!resp.error().unwrap().retryable);
    }

    #[tokio::test]
    async fn test_retries_count_against_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let loop_step = Step::Reply(LlmResponse::with_tool_calls(vec![tool_call(
            "",
            "read_file",
            r#"{"path": "notes.txt"}"#,
        )]));
        let provider = ScriptedProvider::with_fallback(
            vec![
                Step::Fail(ProviderError::rate_limited("429", None)),
                loop_step.clone(),
                Step::Fail(ProviderError::rate_limited("429", None)),
            ],
            Some(loop_step),
        );
        let config = AgentConfig {
            max_iterations: 2,
            ..AgentConfig::default()
        };
        let orch = orchestrator_with(dir.path(), catalog(), Arc::clone(&provider), config);

        let resp = orch.process("loop with retries", &[], None).await;

        assert_eq!(resp.error_code(), Some(ErrorKind::MaxIterationsReached));
        assert_eq!(provider.models_called(), vec!["m1", "m2"]);
        assert_eq!(resp.tools_used().len(), 1);
    }

    #[tokio::test]
    async fn test_over_limit_model_is_not_called() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::with_fallback(
            Vec::new(),
            Some(Step::Reply(LlmResponse::text("ok"))),
        );
        let catalog = vec![ModelDescriptor::new("only", "mock", 2, 1_000_000, 1_000, 0)];
        let orch = orchestrator_with(dir.path(), catalog, Arc::clone(&provider), AgentConfig::default());

        let mut responses = Vec::new();
        for i in 0..6 {
            responses.push(orch.process(&format!("request {}", i), &[], None).await);
        }

        assert_eq!(responses.iter().filter(|r| r.is_success()).count(), 2);
        assert_eq!(provider.models_called().len(), 2);
        for resp in &responses[2..] {
            assert_eq!(resp.error_code(), Some(ErrorKind::RateLimitExceeded));
            let retry_after = resp.error().unwrap().retry_after.unwrap();
            assert!((1..=60).contains(&retry_after));
        }
        // Refusing the call is not a provider violation.
        assert!(orch.router().snapshot()[0].blacklisted_until.is_none());
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_a_tool_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse::with_tool_calls(vec![tool_call(
                "call_1",
                "read_file",
                "{\"path\": ",
            )])),
            Step::Reply(LlmResponse::text("Sorry, let me fix that.")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("read it", &[], None).await;

        assert_eq!(resp.status(), Status::Success);
        let used = &resp.tools_used()[0];
        assert!(used.result.starts_with("Error [TOOL_EXECUTION_ERROR]: invalid arguments"));
        assert_eq!(used.args, Value::String("{\"path\": ".into()));

        let second = provider.messages_of_call(1);
        let tool_turn = second.last().unwrap();
        assert_eq!(tool_turn.role, Role::Tool);
        assert!(tool_turn.content_as_str().unwrap().starts_with("Error [TOOL_EXECUTION_ERROR]"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_policy_rejection_do_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse::with_tool_calls(vec![
                tool_call("x", "teleport", "{}"),
                tool_call("x", "execute_terminal_command", r#"{"command": "rm -rf /"}"#),
                tool_call("", "write_file", r#"{"path": "../../etc/passwd", "content": "x"}"#),
            ])),
            Step::Reply(LlmResponse::text("I can't do those things.")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("do risky things", &[], None).await;

        assert_eq!(resp.status(), Status::Success);
        let results: Vec<&str> = resp.tools_used().iter().map(|t| t.result.as_str()).collect();
        assert!(results[0].starts_with("Error [TOOL_EXECUTION_ERROR]: unknown tool 'teleport'"));
        assert!(results[1].starts_with("Error [COMMAND_NOT_ALLOWED]"));
        assert!(results[2].starts_with("Error [PATH_NOT_ALLOWED]"));

        // Duplicate and missing ids are made unique.
        let second = provider.messages_of_call(1);
        let ids: Vec<&str> = second
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["x", "x_2", "call_3"]);
    }

    #[tokio::test]
    async fn test_authentication_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Step::Fail(ProviderError::new(
            ErrorKind::AuthenticationError,
            "invalid api key",
        ))]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("hi", &[], None).await;

        assert_eq!(resp.error_code(), Some(ErrorKind::AuthenticationError));
        assert_eq!(resp.error().unwrap().message, "invalid api key");
        assert_eq!(provider.models_called().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse::text("  ")),
            Step::Reply(LlmResponse::text("second time lucky")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));
        let resp = orch.process("hi", &[], None).await;
        assert_eq!(resp.response(), Some("second time lucky"));

        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse::text("")),
            Step::Reply(LlmResponse::text("")),
            Step::Reply(LlmResponse::text("never reached")),
        ]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));
        let resp = orch.process("hi", &[], None).await;
        assert_eq!(resp.error_code(), Some(ErrorKind::EmptyResponse));
        assert_eq!(provider.models_called().len(), 2);
    }

    #[tokio::test]
    async fn test_model_attempts_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::with_fallback(
            Vec::new(),
            Some(Step::Fail(ProviderError::new(ErrorKind::ModelUnavailable, "503"))),
        );
        let config = AgentConfig {
            max_model_attempts: 3,
            ..AgentConfig::default()
        };
        let orch = orchestrator_with(dir.path(), catalog(), Arc::clone(&provider), config);

        let resp = orch.process("hi", &[], None).await;

        assert_eq!(resp.error_code(), Some(ErrorKind::ModelUnavailable));
        assert!(resp.error().unwrap().retryable);
        assert_eq!(provider.models_called().len(), 3);
    }

    #[tokio::test]
    async fn test_model_hint_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Step::Reply(LlmResponse::text("from m2"))]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));

        let resp = orch.process("hi", &[], Some("m2")).await;

        assert_eq!(provider.models_called(), vec!["m2"]);
        assert_eq!(resp.model_info().unwrap().provider, "mock");
    }

    #[tokio::test]
    async fn test_deadline_after_tools_gives_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Step::Reply(LlmResponse {
                content: Some("Writing the file first.".into()),
                ..LlmResponse::with_tool_calls(vec![tool_call(
                    "w",
                    "write_file",
                    r#"{"path": "out.txt", "content": "data"}"#,
                )])
            }),
            Step::Stall(Duration::from_secs(10)),
        ]);
        let config = AgentConfig {
            request_timeout: Duration::from_millis(300),
            ..AgentConfig::default()
        };
        let orch = orchestrator_with(dir.path(), catalog(), Arc::clone(&provider), config);

        let resp = orch.process("write then think", &[], None).await;

        assert_eq!(resp.status(), Status::PartialSuccess);
        assert_eq!(resp.response(), Some("Writing the file first."));
        assert_eq!(resp.data().unwrap()["reason"], "TIMEOUT");
        assert_eq!(resp.tools_used().len(), 1);
        assert!(dir.path().join("ws").join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_deadline_without_tools_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Step::Stall(Duration::from_secs(10))]);
        let config = AgentConfig {
            request_timeout: Duration::from_millis(100),
            ..AgentConfig::default()
        };
        let orch = orchestrator_with(dir.path(), catalog(), provider, config);

        let resp = orch.process("slow", &[], None).await;
        assert_eq!(resp.error_code(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Step::Reply(LlmResponse::text("unused"))]);
        let orch = orchestrator(dir.path(), Arc::clone(&provider));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = ProcessRequest {
            message: "hi".into(),
            model_id: None,
            session_id: Some("s-1".into()),
        };
        let resp = orch.handle(&request, &[], &cancel).await;

        assert_eq!(resp.error_code(), Some(ErrorKind::Cancelled));
        assert!(provider.models_called().is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(Vec::new());
        let orch = orchestrator(dir.path(), Arc::clone(&provider));
        let resp = orch.process("   ", &[], None).await;
        assert_eq!(resp.error_code(), Some(ErrorKind::InvalidRequest));
        assert!(provider.models_called().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_respect_rpm() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::with_fallback(
            Vec::new(),
            Some(Step::Reply(LlmResponse::text("ok"))),
        );
        let catalog = vec![
            ModelDescriptor::new("tight", "mock", 3, 1_000_000, 1_000, 90),
            ModelDescriptor::new("roomy", "mock", 100, 1_000_000, 1_000, 10),
        ];
        let orch = Arc::new(orchestrator_with(
            dir.path(),
            catalog,
            Arc::clone(&provider),
            AgentConfig::default(),
        ));

        let runs = (0..12).map(|i| {
            let orch = Arc::clone(&orch);
            async move { orch.process(&format!("request {}", i), &[], None).await }
        });
        let responses = futures::future::join_all(runs).await;

        assert!(responses.iter().all(|r| r.is_success()));
        let models = provider.models_called();
        assert_eq!(models.len(), 12);
        assert_eq!(models.iter().filter(|m| *m == "tight").count(), 3);
    }

    #[test]
    fn test_process_request_wire_format() {
        let req: ProcessRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(req.message, "hi");
        assert!(req.model_id.is_none());
        assert!(req.session_id.is_none());
    }
}
