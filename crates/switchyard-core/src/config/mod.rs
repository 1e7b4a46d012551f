//! Configuration module for switchyard.
//!
//! Loads typed configuration from `config.json` (current directory) or
//! `~/.switchyard/config.json`. All fields use `serde` defaults, so a
//! config file only needs to name what it changes.

use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::router::ledger::BackoffPolicy;
use crate::router::ModelDescriptor;

/// Environment variable prefix for provider key overrides,
/// e.g. `SWITCHYARD_API_KEY_GROQ`.
const API_KEY_ENV_PREFIX: &str = "SWITCHYARD_API_KEY_";

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub models: Vec<ModelDescriptor>,
    pub agents: AgentsConfig,
    pub tools: ToolsConfig,
    pub router: RouterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: ProvidersConfig::default(),
            models: default_catalog(),
            agents: AgentsConfig::default(),
            tools: ToolsConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority:
    /// 1. local `config.json` in current directory
    /// 2. `~/.switchyard/config.json`
    ///
    /// Falls back to defaults when neither exists. Provider keys from the
    /// environment override whatever the file says.
    pub fn load() -> anyhow::Result<Self> {
        let paths = [PathBuf::from("config.json"), Self::default_path()];

        let mut config = match paths.iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::debug!("Loading config from: {}", path.display());
                Self::load_from(path)?
            }
            None => Config::default(),
        };

        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Apply `SWITCHYARD_API_KEY_<PROVIDER>` overrides.
    pub fn apply_env_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(provider) = key.strip_prefix(API_KEY_ENV_PREFIX) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let provider = provider.to_lowercase();
            tracing::info!(provider = %provider, "Using API key from environment variable");
            self.providers
                .entries
                .entry(provider)
                .or_default()
                .api_key = value;
        }
    }

    /// Get the default config file path (`~/.switchyard/config.json`).
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Get the default config directory path.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchyard")
    }

    /// Get the resolved workspace path (the sandbox root for tools).
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// Get the resolved router state file path.
    pub fn state_path(&self) -> PathBuf {
        match &self.router.state_file {
            Some(raw) => expand_home(raw),
            None => Self::config_dir().join("router_state.json"),
        }
    }

    /// Write the default config template to disk.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = serde_json::json!({
            "providers": {
                "groq": {
                    "apiKey": "gsk_YOUR_KEY_HERE"
                }
            },
            "agents": {
                "defaults": {
                    "model": "llama-3.3-70b-versatile",
                    "maxToolIterations": 5
                }
            },
            "tools": {
                "webSearch": {
                    "apiKey": ""
                }
            }
        });

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }

    /// Validate configuration and return actionable error messages.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.providers.find_all_active().is_empty() {
            errors.push(
                "No LLM provider configured with a real API key. \
                 Edit config.json and replace the placeholder key."
                    .into(),
            );
        }

        if self.models.is_empty() {
            errors.push("The model catalog is empty. Add at least one entry to `models`.".into());
        }

        let mut seen = HashSet::new();
        for m in &self.models {
            if !seen.insert(m.id.as_str()) {
                errors.push(format!("Model '{}' appears more than once in `models`.", m.id));
            }
            if m.rpm == 0 || m.rpd == 0 {
                errors.push(format!("Model '{}' has a zero rpm/rpd limit.", m.id));
            }
        }

        let default_model = &self.agents.defaults.model;
        if default_model.is_empty() {
            errors.push("agents.defaults.model is empty. Specify a model name.".into());
        } else if !self.models.iter().any(|m| &m.id == default_model) {
            errors.push(format!(
                "agents.defaults.model '{}' is not in the model catalog.",
                default_model
            ));
        }

        if self.agents.defaults.max_tool_iterations == 0 {
            errors.push("agents.defaults.maxToolIterations must be at least 1.".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if raw.starts_with("~/") || raw.starts_with("~\\") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&raw[2..])
    } else {
        PathBuf::from(raw)
    }
}

/// Built-in catalog used when the config file doesn't define `models`.
pub fn default_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("llama-3.3-70b-versatile", "groq", 30, 12_000, 1_000, 90),
        ModelDescriptor::new(
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "groq",
            30,
            30_000,
            1_000,
            80,
        ),
        ModelDescriptor::new("qwen/qwen3-32b", "groq", 60, 6_000, 1_000, 70),
        ModelDescriptor::new("llama-3.1-8b-instant", "groq", 30, 6_000, 14_400, 60),
        ModelDescriptor::new(
            "deepseek/deepseek-chat-v3-0324:free",
            "openrouter",
            20,
            100_000,
            50,
            50,
        ),
    ]
}

// ── Provider Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderEntry {
    pub api_key: String,
    pub api_base: Option<String>,
}

/// Provider name → credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig {
    pub entries: BTreeMap<String, ProviderEntry>,
}

impl ProvidersConfig {
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.get(name)
    }

    /// Find all configured providers that have a real API key.
    pub fn find_all_active(&self) -> Vec<(&str, &ProviderEntry)> {
        let placeholder_prefixes = ["YOUR_", "sk-or-v1-YOUR", "sk-YOUR", "gsk_YOUR"];

        self.entries
            .iter()
            .filter(|(_, e)| {
                !e.api_key.is_empty()
                    && !placeholder_prefixes.iter().any(|p| e.api_key.contains(p))
            })
            .map(|(name, e)| (name.as_str(), e))
            .collect()
    }
}

// ── Agent Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    pub workspace: String,
    /// Fallback model when nothing else is eligible or preferred.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_iterations: u32,
    /// Model calls allowed per iteration when a call fails retryably.
    pub max_model_attempts: u32,
    pub request_timeout_seconds: u64,
    /// Extra instructions appended to the built-in system prompt.
    pub system_prompt: Option<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.switchyard/workspace".into(),
            model: "llama-3.3-70b-versatile".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_iterations: 5,
            max_model_attempts: 3,
            request_timeout_seconds: 180,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

// ── Tools Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    pub exec: ExecConfig,
    pub files: FilesConfig,
    pub web: WebConfig,
    pub web_search: WebSearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecConfig {
    pub timeout_seconds: u64,
    /// Leading tokens (program names) that may be executed.
    pub allowed_commands: Vec<String>,
    /// Regular expressions; a command matching any of them is rejected.
    pub denied_patterns: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            allowed_commands: [
                "ls", "pwd", "cat", "head", "tail", "wc", "grep", "echo", "date", "whoami",
                "uname", "df", "du", "ps", "git", "tree",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            denied_patterns: [
                r"rm\s+-[a-zA-Z]*[rf][a-zA-Z]*\s+/(\s|$|\*)",
                r"\bmkfs(\.\w+)?\b",
                r"\bdd\s+if=",
                r"\bformat\s+[a-zA-Z]:",
                r"\b(shutdown|reboot|halt|poweroff)\b",
                r":\(\)\s*\{\s*:\|:&\s*\};:",
                r">\s*/dev/sd[a-z]",
                r"\bchmod\s+-R\s+777\s+/",
                r"\bsudo\b",
                r"\bfind\b.*\s-(delete|exec|execdir|ok|okdir|fprint0?|fprintf|fls)\b",
                r"\bgit\b.*\s(-c|--exec-path|--config-env)(\s|=|$)",
                r"\bgit\s+config\b",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_output_bytes: 50_000,
        }
    }
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesConfig {
    pub max_read_bytes: u64,
    pub max_write_bytes: usize,
    pub max_list_entries: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_read_bytes: 1_048_576,
            max_write_bytes: 1_048_576,
            max_list_entries: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebConfig {
    pub timeout_seconds: u64,
    pub max_chars: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 15,
            max_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSearchConfig {
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

// ── Router Configuration ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    /// Where the provider/model preference is persisted.
    pub state_file: Option<String>,
    pub state_cache_ttl_seconds: u64,
    pub backoff: BackoffConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            state_cache_ttl_seconds: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_seconds: u64,
    pub multiplier: f64,
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 30,
            multiplier: 2.0,
            max_seconds: 1_800,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_seconds),
            multiplier: self.multiplier,
            max: Duration::from_secs(self.max_seconds),
        }
    }
}
