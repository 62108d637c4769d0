//! Write tool: create or overwrite a file.

use std::sync::Arc;

use async_trait::async_trait;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};
use serde::Deserialize;

use crate::env::{ToolEnv, parse_args};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteArgs {
    file_path: String,
    content: String,
}

pub struct WriteTool {
    env: Arc<ToolEnv>,
}

impl WriteTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn id(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "The path of the file to write" },
                "content": { "type": "string", "description": "The content to write to the file" }
            },
            "required": ["filePath", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: WriteArgs = parse_args("write", arguments)?;
        let path = self.env.resolve(ctx, "write", &args.file_path)?;
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);

        self.env
            .guard_edit(
                ctx,
                &path,
                serde_json::json!({ "filePath": path.display().to_string(), "content": args.content }),
            )
            .await?;

        let fail = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: "write".into(),
            reason: format!("Failed to write {}: {e}", path.display()),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        tokio::fs::write(&path, &args.content).await.map_err(fail)?;

        Ok(ToolOutput::new(self.env.relative(&path), "").with_metadata(serde_json::json!({
            "filepath": path.display().to_string(),
            "exists": exists,
        })))
    }
}
