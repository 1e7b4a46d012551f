//! Tool system: trait, registry, executor, and built-in tool implementations.
//!
//! Every tool implements the `Tool` trait and is registered once at startup
//! in the `ToolRegistry`, which validates names and parameter schemas. The
//! orchestrator never calls tools directly; it goes through the
//! `ToolExecutor`, which checks arguments against the declared schema and
//! folds every failure into a tagged string the model can read.

pub mod filesystem;
pub mod shell;
pub mod web;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ToolError};
use crate::provider::types::{ToolDefinition, ToolFunctionDef};

/// Parsed tool arguments.
pub type ToolArgs = HashMap<String, Value>;

/// Trait that all tools must implement.
///
/// Tools only see their own arguments; they have no access to routing,
/// ledger or conversation state.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in function calls (e.g., "read_file").
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// Declared parameters, keyed by name.
    fn parameters(&self) -> BTreeMap<String, ParamSpec>;

    /// Execute the tool with arguments that already passed schema checks.
    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError>;
}

// ── Schemas ─────────────────────────────────────────────────────────

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(param_type: ParamType, description: &str) -> Self {
        Self {
            param_type,
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(param_type: ParamType, description: &str) -> Self {
        Self {
            param_type,
            description: description.to_string(),
            required: false,
        }
    }
}

/// Build a parameter map from `(name, spec)` pairs.
pub fn params<const N: usize>(entries: [(&str, ParamSpec); N]) -> BTreeMap<String, ParamSpec> {
    entries
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect()
}

/// Immutable catalog entry for a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
}

impl ToolSpec {
    /// OpenAI function-calling definition (JSON Schema parameters).
    pub fn to_definition(&self) -> ToolDefinition {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    json!({"type": p.param_type, "description": p.description}),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|(_, p)| p.required)
            .map(|(name, _)| name.as_str())
            .collect();

        ToolDefinition {
            def_type: "function".into(),
            function: ToolFunctionDef {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            },
        }
    }

    /// Check arguments against the declared parameters.
    pub fn validate_args(&self, args: &ToolArgs) -> Result<(), ToolError> {
        for (name, spec) in &self.parameters {
            match args.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required parameter '{}'",
                        name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.param_type.matches(value) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "parameter '{}' must be of type {:?}",
                        name, spec.param_type
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// ── Invocations and results ─────────────────────────────────────────

/// One tool call from the model, with its arguments parsed.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub parsed_arguments: ToolArgs,
}

impl ToolInvocation {
    /// Parse the model's raw argument text. An empty string means `{}`.
    pub fn parse(id: &str, name: &str, raw_arguments: &str) -> Result<Self, ToolError> {
        let trimmed = raw_arguments.trim();
        let parsed_arguments = if trimmed.is_empty() {
            ToolArgs::new()
        } else {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                Ok(other) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "arguments must be a JSON object, got {}",
                        json_type_name(&other)
                    )))
                }
                Err(e) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "arguments are not valid JSON ({})",
                        e
                    )))
                }
            }
        };

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            raw_arguments: raw_arguments.to_string(),
            parsed_arguments,
        })
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Outcome of one invocation, appended to the conversation as a tool turn.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub invocation_id: String,
    pub tool_name: String,
    pub output: String,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
}

impl ToolResult {
    pub fn success(invocation_id: &str, tool_name: &str, output: String) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            tool_name: tool_name.to_string(),
            output,
            ok: true,
            error_kind: None,
        }
    }

    pub fn failure(invocation_id: &str, tool_name: &str, error: &ToolError) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            tool_name: tool_name.to_string(),
            output: error.to_tool_output(),
            ok: false,
            error_kind: Some(error.kind()),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid tool name '{0}': use letters, digits, '_' or '-'")]
    InvalidName(String),

    #[error("tool '{tool}' declares an invalid parameter name '{param}'")]
    InvalidParameter { tool: String, param: String },
}

struct Entry {
    spec: ToolSpec,
    tool: Box<dyn Tool>,
}

/// Static catalog of callable tools, unique by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, validating its name and schema.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if !valid_identifier(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        let parameters = tool.parameters();
        if let Some(bad) = parameters.keys().find(|p| !valid_identifier(p)) {
            return Err(RegistryError::InvalidParameter {
                tool: name,
                param: bad.clone(),
            });
        }

        let spec = ToolSpec {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters,
        };
        debug!(tool = %name, params = spec.parameters.len(), "Registered tool");
        self.tools.insert(name, Entry { spec, tool });
        Ok(())
    }

    /// All specs, ordered by name.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|e| &e.spec).collect()
    }

    /// Get all tool definitions in OpenAI function-calling format.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|e| e.spec.to_definition()).collect()
    }

    /// Schema export: `[{name, description, parameters: {prop: {type, description, required}}}]`.
    pub fn export_schema(&self) -> Value {
        serde_json::to_value(self.specs()).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ── Executor ────────────────────────────────────────────────────────

/// Runs tools by name under the registry's schemas. Never fails: every
/// error comes back as a `ToolResult` with `ok == false`.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute a tool by name and return the text for the model.
    pub async fn execute(&self, name: &str, args: ToolArgs) -> String {
        let invocation = ToolInvocation {
            id: String::new(),
            name: name.to_string(),
            raw_arguments: String::new(),
            parsed_arguments: args,
        };
        self.run(&invocation).await.output
    }

    /// Execute one parsed invocation.
    pub async fn run(&self, invocation: &ToolInvocation) -> ToolResult {
        let id = invocation.id.as_str();
        let name = invocation.name.as_str();

        let Some(entry) = self.registry.tools.get(name) else {
            warn!(tool = name, "Tool not found");
            return ToolResult::failure(id, name, &ToolError::UnknownTool(name.to_string()));
        };

        if let Err(e) = entry.spec.validate_args(&invocation.parsed_arguments) {
            debug!(tool = name, error = %e, "Rejected tool arguments");
            return ToolResult::failure(id, name, &e);
        }

        debug!(tool = name, id, "Executing tool");
        match entry.tool.execute(&invocation.parsed_arguments).await {
            Ok(output) => ToolResult::success(id, name, output),
            Err(e) => {
                match e.kind() {
                    ErrorKind::CommandNotAllowed | ErrorKind::PathNotAllowed => {
                        warn!(tool = name, kind = %e.kind(), error = %e, "Security policy rejected tool call");
                    }
                    _ => debug!(tool = name, error = %e, "Tool failed"),
                }
                ToolResult::failure(id, name, &e)
            }
        }
    }
}

// ── Argument helpers ────────────────────────────────────────────────

pub(crate) fn get_string_arg(args: &ToolArgs, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub(crate) fn get_int_arg(args: &ToolArgs, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

pub(crate) fn get_bool_arg(args: &ToolArgs, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

pub(crate) fn require_string(args: &ToolArgs, key: &str) -> Result<String, ToolError> {
    get_string_arg(args, key)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' parameter is required", key)))
}

/// Cut `text` to at most `max_bytes` on a char boundary.
pub(crate) fn truncate_bytes(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}
