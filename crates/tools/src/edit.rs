//! Edit tool: exact string replacement inside a file.

use std::sync::Arc;

use async_trait::async_trait;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};
use serde::Deserialize;

use crate::env::{ToolEnv, parse_args};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

pub struct EditTool {
    env: Arc<ToolEnv>,
}

impl EditTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

fn failed(reason: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "edit".into(),
        reason: reason.into(),
    }
}

/// Apply one replacement to `content`. Returns the new text and the match count.
fn replace(content: &str, old: &str, new: &str, replace_all: bool) -> Result<(String, usize), ToolError> {
    let count = content.matches(old).count();
    match count {
        0 => Err(failed("oldString not found in content")),
        1 => Ok((content.replacen(old, new, 1), 1)),
        n if replace_all => Ok((content.replace(old, new), n)),
        _ => Err(failed(
            "oldString found multiple times and requires more code context to uniquely identify the intended match",
        )),
    }
}

#[async_trait]
impl Tool for EditTool {
    fn id(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. oldString must match exactly once unless replaceAll is set. \
         An empty oldString creates the file with newString as its content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "The path of the file to modify" },
                "oldString": { "type": "string", "description": "The text to replace" },
                "newString": { "type": "string", "description": "The text to replace it with" },
                "replaceAll": { "type": "boolean", "description": "Replace all occurrences of oldString" }
            },
            "required": ["filePath", "oldString", "newString"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: EditArgs = parse_args("edit", arguments)?;
        if args.old_string == args.new_string {
            return Err(failed("oldString and newString must be different"));
        }
        let path = self.env.resolve(ctx, "edit", &args.file_path)?;

        let (updated, replacements) = if args.old_string.is_empty() {
            (args.new_string.clone(), 0)
        } else {
            let current = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| failed(format!("File {} not found: {e}", path.display())))?;
            replace(&current, &args.old_string, &args.new_string, args.replace_all)?
        };

        self.env
            .guard_edit(
                ctx,
                &path,
                serde_json::json!({
                    "filePath": path.display().to_string(),
                    "oldString": args.old_string,
                    "newString": args.new_string,
                }),
            )
            .await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| failed(format!("Failed to write {}: {e}", path.display())))?;

        Ok(ToolOutput::new(self.env.relative(&path), "")
            .with_metadata(serde_json::json!({ "replacements": replacements })))
    }
}
