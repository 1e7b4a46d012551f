//! Context builder for assembling the system prompt.
//!
//! Assembles identity, workspace instructions and the tool catalog into
//! the first message of every orchestration run.

use chrono::{DateTime, Utc};
use std::path::Path;

use crate::provider::types::ChatMessage;
use crate::tools::ToolRegistry;

/// Workspace files whose contents are appended to the prompt.
const BOOTSTRAP_FILES: &[&str] = &["SYSTEM.md", "INSTRUCTIONS.md"];

/// Builds the context (system prompt + messages) for one run.
pub struct ContextBuilder<'a> {
    workspace: &'a Path,
    tools: &'a ToolRegistry,
    extra_prompt: Option<&'a str>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(workspace: &'a Path, tools: &'a ToolRegistry, extra_prompt: Option<&'a str>) -> Self {
        Self {
            workspace,
            tools,
            extra_prompt,
        }
    }

    /// Build the complete system prompt.
    pub fn build_system_prompt(&self, now: DateTime<Utc>) -> String {
        let mut sections = vec![self.identity(now)];

        let tools = self.tool_summary();
        if !tools.is_empty() {
            sections.push(tools);
        }

        if let Some(bootstrap) = self.load_bootstrap_files() {
            sections.push(bootstrap);
        }

        if let Some(extra) = self.extra_prompt.map(str::trim).filter(|s| !s.is_empty()) {
            sections.push(format!("# Additional Instructions\n\n{}", extra));
        }

        sections.join("\n\n")
    }

    /// System prompt, then history, then the new user turn.
    pub fn build_messages(&self, history: &[ChatMessage], current_message: &str) -> Vec<ChatMessage> {
        let system_prompt = self.build_system_prompt(Utc::now());
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&system_prompt));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(current_message));
        messages
    }

    fn identity(&self, now: DateTime<Utc>) -> String {
        format!(
            r#"# Identity

You are **switchyard**, an assistant that can act on the user's machine through tools.

## Environment
- Workspace: `{}`
- Current time: {}
- Platform: {} ({})

## Guidelines
- Use tools when needed; don't guess about file contents or command outputs.
- Tool errors start with `Error [CODE]:`. Read them and adjust instead of repeating the same call.
- Commands run without a shell: no pipes, redirection or chaining.
- Be concise and accurate."#,
            self.workspace.display(),
            now.format("%Y-%m-%d %H:%M:%S UTC"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }

    fn tool_summary(&self) -> String {
        let specs = self.tools.specs();
        if specs.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = specs
            .iter()
            .map(|s| format!("- `{}`: {}", s.name, s.description))
            .collect();
        format!("# Tools\n\n{}", lines.join("\n"))
    }

    fn load_bootstrap_files(&self) -> Option<String> {
        let parts: Vec<String> = BOOTSTRAP_FILES
            .iter()
            .filter_map(|name| {
                let content = std::fs::read_to_string(self.workspace.join(name)).ok()?;
                let content = content.trim();
                (!content.is_empty()).then(|| format!("## {}\n\n{}", name, content))
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(format!("# Workspace\n\n{}", parts.join("\n\n")))
        }
    }
}
