//! Terminal command tool.
//!
//! Commands are never handed to a shell. The command line is split with
//! `shlex`, the leading token must be on the allow-list, the whole line
//! must not match any deny pattern, and shell operators are refused. The
//! program then runs directly inside the workspace with a hard timeout.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::filesystem::FileSandbox;
use super::{get_int_arg, get_string_arg, params, require_string, truncate_bytes};
use super::{ParamSpec, ParamType, Tool, ToolArgs};
use crate::config::ExecConfig;
use crate::error::ToolError;

/// Tokens that only mean something to a shell.
const SHELL_OPERATORS: &[&str] = &["|", "||", "&", "&&", ";", ">", ">>", "<", "<<", "2>", "2>&1"];

/// What may be executed, and for how long.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
    denied: Vec<Regex>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandPolicy {
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        denied: &[String],
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<Self, regex::Error> {
        let denied = denied
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed: allowed.into_iter().collect(),
            denied,
            timeout,
            max_output_bytes,
        })
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self, regex::Error> {
        Self::new(
            config.allowed_commands.iter().cloned(),
            &config.denied_patterns,
            config.timeout(),
            config.max_output_bytes,
        )
    }

    /// Validate a command line and return its argv.
    pub fn check(&self, command: &str) -> Result<Vec<String>, ToolError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ToolError::InvalidArguments("command is empty".into()));
        }

        if let Some(pattern) = self.denied.iter().find(|re| re.is_match(command)) {
            return Err(ToolError::CommandNotAllowed(format!(
                "command matches a denied pattern ({})",
                pattern.as_str()
            )));
        }

        let argv = shlex::split(command).ok_or_else(|| {
            ToolError::InvalidArguments("command has unbalanced quotes or escapes".into())
        })?;

        let Some(program) = argv.first() else {
            return Err(ToolError::InvalidArguments("command is empty".into()));
        };

        if !self.allowed.contains(program.as_str()) {
            return Err(ToolError::CommandNotAllowed(format!(
                "'{}' is not in the allowed command list",
                program
            )));
        }

        if let Some(op) = argv.iter().find(|t| SHELL_OPERATORS.contains(&t.as_str())) {
            return Err(ToolError::CommandNotAllowed(format!(
                "shell operator '{}' is not supported; run one command at a time",
                op
            )));
        }

        Ok(argv)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn allowed_commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.allowed.iter().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

pub struct TerminalTool {
    policy: CommandPolicy,
    sandbox: Arc<FileSandbox>,
    description: String,
}

impl TerminalTool {
    pub fn new(policy: CommandPolicy, sandbox: Arc<FileSandbox>) -> Self {
        let description = format!(
            "Execute a terminal command inside the workspace and return its exit code, \
             stdout and stderr. Allowed programs: {}. Pipes and redirection are not supported.",
            policy.allowed_commands().join(", ")
        );
        Self {
            policy,
            sandbox,
            description,
        }
    }

    fn format_output(&self, exit_code: i32, stdout: &[u8], stderr: &[u8]) -> String {
        let stdout = String::from_utf8_lossy(stdout);
        let stderr = String::from_utf8_lossy(stderr);
        let max = self.policy.max_output_bytes;

        let mut result = format!("[exit code: {}]", exit_code);
        for (label, stream) in [("stdout", &stdout), ("stderr", &stderr)] {
            if stream.is_empty() {
                continue;
            }
            let (text, truncated) = truncate_bytes(stream, max);
            result.push_str(&format!("\n[{}]\n{}", label, text));
            if truncated {
                result.push_str(&format!("\n... (truncated, {} total bytes)", stream.len()));
            }
        }
        if stdout.is_empty() && stderr.is_empty() {
            result.push_str("\n(no output)");
        }
        result
    }
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "execute_terminal_command"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([
            (
                "command",
                ParamSpec::required(ParamType::String, "The command line to execute"),
            ),
            (
                "cwd",
                ParamSpec::optional(
                    ParamType::String,
                    "Working directory relative to the workspace (default: workspace root)",
                ),
            ),
            (
                "timeout",
                ParamSpec::optional(
                    ParamType::Integer,
                    "Timeout in seconds (cannot exceed the configured limit)",
                ),
            ),
        ])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let command = require_string(args, "command")?;
        let argv = self.policy.check(&command)?;

        let cwd = match get_string_arg(args, "cwd") {
            Some(raw) => self.sandbox.resolve(&raw)?,
            None => self.sandbox.root().to_path_buf(),
        };

        let limit = self.policy.timeout;
        let timeout = get_int_arg(args, "timeout")
            .filter(|t| *t > 0)
            .map(|t| Duration::from_secs(t as u64).min(limit))
            .unwrap_or(limit);

        debug!(command = %command, cwd = %cwd.display(), timeout_secs = timeout.as_secs(), "Executing terminal command");

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&cwd)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(self.format_output(
                output.status.code().unwrap_or(-1),
                &output.stdout,
                &output.stderr,
            )),
            Ok(Err(e)) => Err(ToolError::Failed(format!(
                "failed to start '{}': {}",
                argv[0], e
            ))),
            Err(_) => Err(ToolError::Timeout(timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::ToolExecutor;
    use crate::tools::ToolRegistry;
    use serde_json::json;

    fn policy() -> CommandPolicy {
        CommandPolicy::from_config(&ExecConfig::default()).unwrap()
    }

    #[test]
    fn test_allow_list_on_leading_token() {
        let p = policy();
        assert_eq!(p.check("ls -la").unwrap(), vec!["ls", "-la"]);
        assert!(p.check("git status").is_ok());

        for cmd in ["rm -rf /", "curl http://x", "bash -c ls", "/bin/ls", "LS"] {
            let err = p.check(cmd).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CommandNotAllowed, "{}", cmd);
        }
    }

    #[test]
    fn test_deny_patterns_win_over_allow_list() {
        let p = CommandPolicy::new(
            ["rm".to_string(), "dd".to_string()],
            &ExecConfig::default().denied_patterns,
            Duration::from_secs(5),
            1_000,
        )
        .unwrap();

        assert!(p.check("rm -rf /").unwrap_err().to_string().contains("denied pattern"));
        assert!(p.check("rm -fr /*").is_err());
        assert!(p.check("dd if=/dev/zero of=/dev/sda").is_err());
        assert!(p.check("rm notes.txt").is_ok());
    }

    #[test]
    fn test_default_policy_refuses_code_runners() {
        let p = policy();
        for cmd in [
            "python3 -c \"open('/tmp/x','w').write('x')\"",
            "node -e 1",
            "cargo run",
            "find / -name x -delete",
            "git -c core.pager=sh log",
            "git config alias.x '!sh'",
        ] {
            let err = p.check(cmd).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CommandNotAllowed, "{}", cmd);
        }

        // Explicitly allowing `find` still keeps its side-effecting actions out.
        let with_find = CommandPolicy::new(
            ["find".to_string()],
            &ExecConfig::default().denied_patterns,
            Duration::from_secs(5),
            1_000,
        )
        .unwrap();
        assert!(with_find.check("find . -name '*.rs'").is_ok());
        for cmd in ["find . -delete", "find . -exec rm {} +", "find . -okdir rm {} +"] {
            assert!(with_find.check(cmd).is_err(), "{}", cmd);
        }
    }

    #[test]
    fn test_shell_operators_rejected() {
        let p = policy();
        assert!(p.check("ls ; rm -rf ~").is_err());
        assert!(p.check("ls | grep x").is_err());
        assert!(p.check("echo hi > out.txt").is_err());
        // Chained without spaces becomes one unknown program name.
        assert!(p.check("ls;rm").is_err());
        assert!(p.check("echo a&&b").is_ok());
    }

    #[test]
    fn test_malformed_command_lines() {
        let p = policy();
        assert_eq!(
            p.check("   ").unwrap_err().kind(),
            ErrorKind::ToolExecutionError
        );
        assert!(p.check("echo 'unterminated").is_err());
    }

    #[test]
    fn test_bad_deny_pattern_is_reported() {
        assert!(CommandPolicy::new(Vec::new(), &["(".to_string()], Duration::ZERO, 0).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_allowed_command_with_separate_streams() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FileSandbox::new(dir.path(), Default::default()).unwrap());
        let tool = TerminalTool::new(policy(), sandbox);

        let mut args = ToolArgs::new();
        args.insert("command".into(), json!("echo hello"));
        let out = tool.execute(&args).await.unwrap();
        assert!(out.starts_with("[exit code: 0]"));
        assert!(out.contains("[stdout]\nhello"));
        assert!(!out.contains("[stderr]"));

        let mut args = ToolArgs::new();
        args.insert("command".into(), json!("ls does-not-exist"));
        let out = tool.execute(&args).await.unwrap();
        assert!(!out.starts_with("[exit code: 0]"));
        assert!(out.contains("[stderr]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FileSandbox::new(dir.path(), Default::default()).unwrap());
        let policy =
            CommandPolicy::new(["sleep".to_string()], &[], Duration::from_secs(1), 1_000).unwrap();
        let tool = TerminalTool::new(policy, sandbox);

        let mut args = ToolArgs::new();
        args.insert("command".into(), json!("sleep 5"));
        args.insert("timeout".into(), json!(60));
        let err = tool.execute(&args).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_rejection_through_executor() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FileSandbox::new(dir.path(), Default::default()).unwrap());
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(TerminalTool::new(policy(), sandbox)))
            .unwrap();
        let exec = ToolExecutor::new(Arc::new(registry));

        let mut args = ToolArgs::new();
        args.insert("command".into(), json!("rm -rf /"));
        let out = exec.execute("execute_terminal_command", args).await;
        assert!(out.starts_with("Error [COMMAND_NOT_ALLOWED]"));
    }

    #[test]
    fn test_output_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FileSandbox::new(dir.path(), Default::default()).unwrap());
        let policy = CommandPolicy::new(Vec::new(), &[], Duration::from_secs(1), 8).unwrap();
        let tool = TerminalTool::new(policy, sandbox);

        let out = tool.format_output(0, b"0123456789abcdef", b"");
        assert!(out.contains("[stdout]\n01234567\n... (truncated, 16 total bytes)"));
    }
}
