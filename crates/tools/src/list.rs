//! List and grep tools: walking the workspace tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};
use corvid_security::wildcard;
use regex_lite::Regex;
use serde::Deserialize;

use crate::env::{ToolEnv, parse_args};

const LIST_LIMIT: usize = 100;
const GREP_LIMIT: usize = 100;
const GREP_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", ".venv", "__pycache__", ".idea", ".vscode",
];

/// Every file under `root` in path order, stopping after `cap` entries.
async fn walk(root: &Path, extra_ignores: &[String], cap: usize) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry);
        }
        children.sort_by_key(|e| std::cmp::Reverse(e.file_name()));
        for entry in children {
            let name = entry.file_name().to_string_lossy().to_string();
            if extra_ignores.iter().any(|p| wildcard::matches(&name, p)) {
                continue;
            }
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    stack.push(entry.path());
                }
            } else if kind.is_file() {
                files.push(entry.path());
                if files.len() >= cap {
                    files.sort();
                    return Ok(files);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn io_failed(tool: &str, e: std::io::Error) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool.into(),
        reason: e.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    ignore: Vec<String>,
}

pub struct ListTool {
    env: Arc<ToolEnv>,
}

impl ListTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

/// Indented tree of `files` relative to `root`.
fn render_tree(root: &Path, files: &[PathBuf]) -> String {
    let mut by_dir: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for file in files {
        let rel = file.strip_prefix(root).unwrap_or(file);
        let dir = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = rel.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        by_dir.entry(dir).or_default().push(name);
    }

    let mut out = format!("{}/\n", root.display());
    for (dir, names) in by_dir {
        let depth = dir.components().count();
        if depth > 0 {
            out.push_str(&format!("{}{}/\n", "  ".repeat(depth), dir.display()));
        }
        for name in names {
            out.push_str(&format!("{}{name}\n", "  ".repeat(depth + 1)));
        }
    }
    out
}

#[async_trait]
impl Tool for ListTool {
    fn id(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List files under a directory as a tree. Skips VCS and build output directories."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (defaults to the workspace)" },
                "ignore": { "type": "array", "items": { "type": "string" }, "description": "Glob patterns to skip" }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: ListArgs = parse_args("list", arguments)?;
        let root = self.env.resolve(ctx, "list", args.path.as_deref().unwrap_or("."))?;
        let files = walk(&root, &args.ignore, LIST_LIMIT + 1)
            .await
            .map_err(|e| io_failed("list", e))?;
        let truncated = files.len() > LIST_LIMIT;
        let shown = &files[..files.len().min(LIST_LIMIT)];

        Ok(ToolOutput::new(self.env.relative(&root), render_tree(&root, shown))
            .with_metadata(serde_json::json!({ "count": shown.len(), "truncated": truncated })))
    }
}

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    /// File-name glob, e.g. `*.rs`.
    #[serde(default)]
    include: Option<String>,
}

pub struct GrepTool {
    env: Arc<ToolEnv>,
}

impl GrepTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn id(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines grouped by file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "The regex pattern to search for" },
                "path": { "type": "string", "description": "Directory to search (defaults to the workspace)" },
                "include": { "type": "string", "description": "File pattern to include, e.g. \"*.rs\"" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: GrepArgs = parse_args("grep", arguments)?;
        let regex = Regex::new(&args.pattern).map_err(|e| ToolError::InvalidArguments(format!("grep: {e}")))?;
        let root = self.env.resolve(ctx, "grep", args.path.as_deref().unwrap_or("."))?;
        let files = walk(&root, &[], usize::MAX).await.map_err(|e| io_failed("grep", e))?;

        let mut matches: Vec<(PathBuf, usize, String)> = Vec::new();
        'files: for file in files {
            if let Some(include) = &args.include {
                let name = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                if !wildcard::matches(&name, include) {
                    continue;
                }
            }
            let Ok(meta) = tokio::fs::metadata(&file).await else { continue };
            if meta.len() > GREP_MAX_FILE_BYTES {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&file).await else { continue };
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            for (n, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push((file.clone(), n + 1, line.to_string()));
                    if matches.len() > GREP_LIMIT {
                        break 'files;
                    }
                }
            }
        }

        let truncated = matches.len() > GREP_LIMIT;
        matches.truncate(GREP_LIMIT);
        if matches.is_empty() {
            return Ok(ToolOutput::new(args.pattern, "No files found")
                .with_metadata(serde_json::json!({ "matches": 0, "truncated": false })));
        }

        let mut out = format!("Found {} matches\n", matches.len());
        let mut current: Option<&PathBuf> = None;
        for (file, line_no, line) in &matches {
            if current != Some(file) {
                out.push_str(&format!("\n{}:\n", self.env.relative(file)));
                current = Some(file);
            }
            out.push_str(&format!("  Line {line_no}: {line}\n"));
        }
        if truncated {
            out.push_str("\n(Results are truncated. Consider using a more specific path or pattern.)");
        }

        Ok(ToolOutput::new(args.pattern, out)
            .with_metadata(serde_json::json!({ "matches": matches.len(), "truncated": truncated })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::{ctx, env_in};

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn alpha() {}\npub fn beta() {}\n").unwrap();
        std::fs::write(dir.path().join("src/nested/deep.rs"), "fn alpha_helper() {}\n").unwrap();
        std::fs::write(dir.path().join("target/debug/out.rs"), "fn alpha() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn list_renders_tree_without_build_dirs() {
        let dir = workspace();
        let tool = ListTool::new(env_in(dir.path(), Arc::default()));
        let out = tool.execute(serde_json::json!({}), &ctx()).await.unwrap();
        assert!(out.output.contains("Cargo.toml"));
        assert!(out.output.contains("lib.rs"));
        assert!(out.output.contains("deep.rs"));
        assert!(!out.output.contains("out.rs"));
        assert_eq!(out.metadata["count"], 3);
    }

    #[tokio::test]
    async fn list_honors_ignore_globs() {
        let dir = workspace();
        let tool = ListTool::new(env_in(dir.path(), Arc::default()));
        let out = tool
            .execute(serde_json::json!({"ignore": ["*.toml"]}), &ctx())
            .await
            .unwrap();
        assert!(!out.output.contains("Cargo.toml"));
    }

    #[tokio::test]
    async fn grep_groups_matches_by_file() {
        let dir = workspace();
        let tool = GrepTool::new(env_in(dir.path(), Arc::default()));
        let out = tool
            .execute(serde_json::json!({"pattern": "fn alpha", "include": "*.rs"}), &ctx())
            .await
            .unwrap();
        assert!(out.output.starts_with("Found 2 matches"));
        assert!(out.output.contains("Line 1: pub fn alpha() {}"));
        assert!(out.output.contains("deep.rs"));
        assert!(!out.output.contains("out.rs"));
    }

    #[tokio::test]
    async fn grep_reports_no_matches_and_bad_patterns() {
        let dir = workspace();
        let tool = GrepTool::new(env_in(dir.path(), Arc::default()));
        let out = tool
            .execute(serde_json::json!({"pattern": "gamma"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.output, "No files found");

        let err = tool
            .execute(serde_json::json!({"pattern": "("}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
