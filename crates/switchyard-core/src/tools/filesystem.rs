//! Filesystem tools: read_file, write_file, list_directory, file_exists.
//!
//! Every path goes through [`FileSandbox::resolve`], which anchors relative
//! paths at the workspace root, normalizes `..` lexically and rejects
//! anything that ends up outside the root, including escapes through
//! symlinks that already exist on disk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::{get_bool_arg, get_int_arg, get_string_arg, params, require_string};
use super::{ParamSpec, ParamType, Tool, ToolArgs};
use crate::config::FilesConfig;
use crate::error::ToolError;

// ── Sandbox ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FileLimits {
    pub max_read_bytes: u64,
    pub max_write_bytes: usize,
    pub max_list_entries: usize,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self::from(&FilesConfig::default())
    }
}

impl From<&FilesConfig> for FileLimits {
    fn from(c: &FilesConfig) -> Self {
        Self {
            max_read_bytes: c.max_read_bytes,
            max_write_bytes: c.max_write_bytes,
            max_list_entries: c.max_list_entries,
        }
    }
}

/// The directory tools are confined to.
#[derive(Debug)]
pub struct FileSandbox {
    root: PathBuf,
    limits: FileLimits,
}

impl FileSandbox {
    /// Create the sandbox, making sure the root exists.
    pub fn new(root: &Path, limits: FileLimits) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
            limits,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user-supplied path to an absolute path inside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ToolError::InvalidArguments("path is empty".into()));
        }
        if raw.contains('\0') {
            return Err(ToolError::PathNotAllowed("path contains a NUL byte".into()));
        }

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined);

        if !normalized.starts_with(&self.root) {
            return Err(self.denied(raw));
        }

        // Symlinks on the existing part of the path must not lead outside.
        // `symlink_metadata` stops at dangling links too, which writes
        // would otherwise follow.
        let mut existing = normalized.as_path();
        while std::fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        match existing.canonicalize() {
            Ok(real) if real.starts_with(&self.root) => {}
            Ok(_) => return Err(self.denied(raw)),
            Err(_) => {
                return Err(ToolError::PathNotAllowed(format!(
                    "Access denied: path '{}' goes through a broken symlink",
                    raw
                )))
            }
        }

        Ok(normalized)
    }

    fn denied(&self, raw: &str) -> ToolError {
        ToolError::PathNotAllowed(format!(
            "Access denied: path '{}' is outside the workspace '{}'",
            raw,
            self.root.display()
        ))
    }

    /// Path relative to the root, for display.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".into(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

// ── ReadFileTool ────────────────────────────────────────────────────

pub struct ReadFileTool {
    sandbox: Arc<FileSandbox>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<FileSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Supports an optional line range."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([
            (
                "path",
                ParamSpec::required(ParamType::String, "Path relative to the workspace"),
            ),
            (
                "start_line",
                ParamSpec::optional(ParamType::Integer, "Optional 1-indexed start line"),
            ),
            (
                "end_line",
                ParamSpec::optional(ParamType::Integer, "Optional 1-indexed end line (inclusive)"),
            ),
        ])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let raw_path = require_string(args, "path")?;
        let path = self.sandbox.resolve(&raw_path)?;
        let shown = self.sandbox.display(&path);

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("cannot read '{}': {}", shown, e)))?;
        if !meta.is_file() {
            return Err(ToolError::Failed(format!("'{}' is not a regular file", shown)));
        }
        let max = self.sandbox.limits.max_read_bytes;
        if meta.len() > max {
            return Err(ToolError::Failed(format!(
                "'{}' is {} bytes, above the {} byte read limit",
                shown,
                meta.len(),
                max
            )));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("error reading '{}': {}", shown, e)))?;

        let start = get_int_arg(args, "start_line").map(|n| (n.max(1) - 1) as usize);
        let end = get_int_arg(args, "end_line").map(|n| n.max(0) as usize);

        let body = if start.is_some() || end.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let end = end.unwrap_or(lines.len()).min(lines.len());
            let start = start.unwrap_or(0).min(end);
            lines[start..end].join("\n")
        } else {
            content
        };

        Ok(format!("File: {} ({} bytes)\n\n{}", shown, meta.len(), body))
    }
}

// ── WriteFileTool ───────────────────────────────────────────────────

pub struct WriteFileTool {
    sandbox: Arc<FileSandbox>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<FileSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace. Creates the file and parent directories if they don't exist."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([
            (
                "path",
                ParamSpec::required(ParamType::String, "Path relative to the workspace"),
            ),
            (
                "content",
                ParamSpec::required(ParamType::String, "Content to write to the file"),
            ),
            (
                "append",
                ParamSpec::optional(ParamType::Boolean, "Append instead of overwriting"),
            ),
        ])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let raw_path = require_string(args, "path")?;
        let content = require_string(args, "content")?;
        let append = get_bool_arg(args, "append").unwrap_or(false);

        let max = self.sandbox.limits.max_write_bytes;
        if content.len() > max {
            return Err(ToolError::Failed(format!(
                "content is {} bytes, above the {} byte write limit",
                content.len(),
                max
            )));
        }

        let path = self.sandbox.resolve(&raw_path)?;
        let shown = self.sandbox.display(&path);
        if path.is_dir() {
            return Err(ToolError::Failed(format!("'{}' is a directory", shown)));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("error creating directories: {}", e)))?;
        }

        let result = if append {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(mut file) => file.write_all(content.as_bytes()).await,
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(&path, &content).await
        };

        result.map_err(|e| ToolError::Failed(format!("error writing '{}': {}", shown, e)))?;

        let verb = if append { "Appended" } else { "Wrote" };
        Ok(format!("{} {} bytes to '{}'", verb, content.len(), shown))
    }
}

// ── ListDirTool ─────────────────────────────────────────────────────

pub struct ListDirTool {
    sandbox: Arc<FileSandbox>,
}

impl ListDirTool {
    pub fn new(sandbox: Arc<FileSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a workspace directory."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([(
            "path",
            ParamSpec::optional(
                ParamType::String,
                "Directory relative to the workspace (default: workspace root)",
            ),
        )])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let path = match get_string_arg(args, "path") {
            Some(raw) => self.sandbox.resolve(&raw)?,
            None => self.sandbox.root().to_path_buf(),
        };
        let shown = self.sandbox.display(&path);

        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("error listing '{}': {}", shown, e)))?;

        let mut items: Vec<String> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let line = match entry.metadata().await {
                Ok(m) if m.is_dir() => format!("{}/", name),
                Ok(m) if m.is_file() => format!("{}  ({} bytes)", name, m.len()),
                _ => name,
            };
            items.push(line);
        }
        items.sort();

        if items.is_empty() {
            return Ok(format!("'{}' is empty", shown));
        }

        let total = items.len();
        let max = self.sandbox.limits.max_list_entries;
        let mut out = format!("Directory: {} ({} entries)\n", shown, total);
        out.push_str(&items[..total.min(max)].join("\n"));
        if total > max {
            out.push_str(&format!("\n... and {} more", total - max));
        }
        Ok(out)
    }
}

// ── FileExistsTool ──────────────────────────────────────────────────

pub struct FileExistsTool {
    sandbox: Arc<FileSandbox>,
}

impl FileExistsTool {
    pub fn new(sandbox: Arc<FileSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for FileExistsTool {
    fn name(&self) -> &str {
        "file_exists"
    }

    fn description(&self) -> &str {
        "Check whether a path exists in the workspace and whether it is a file or directory."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([(
            "path",
            ParamSpec::required(ParamType::String, "Path relative to the workspace"),
        )])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let raw_path = require_string(args, "path")?;
        let path = self.sandbox.resolve(&raw_path)?;
        let shown = self.sandbox.display(&path);

        Ok(match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_dir() => format!("path: {}\nexists: true\ntype: directory", shown),
            Ok(m) => format!(
                "path: {}\nexists: true\ntype: file\nsize: {} bytes",
                shown,
                m.len()
            ),
            Err(_) => format!("path: {}\nexists: false", shown),
        })
    }
}
