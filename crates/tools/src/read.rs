//! Read tool: line-numbered file contents.

use std::sync::Arc;

use async_trait::async_trait;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};
use serde::Deserialize;

use crate::env::{ToolEnv, parse_args};

pub const DEFAULT_READ_LIMIT: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadArgs {
    file_path: String,
    /// Zero-based line to start from.
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ReadTool {
    env: Arc<ToolEnv>,
}

impl ReadTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

/// Render `content` the way the model sees it.
pub fn render_lines(content: &str, offset: usize, limit: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = String::from("<file>\n");
    for (i, line) in lines.iter().enumerate().skip(offset).take(limit) {
        let shown: String = if line.chars().count() > MAX_LINE_LENGTH {
            let mut s: String = line.chars().take(MAX_LINE_LENGTH).collect();
            s.push_str("...");
            s
        } else {
            line.to_string()
        };
        out.push_str(&format!("{:05}| {shown}\n", i + 1));
    }
    let last = offset + limit;
    if lines.len() > last {
        out.push_str(&format!(
            "\n(File has more lines. Use 'offset' parameter to read beyond line {last})"
        ));
    }
    out.push_str("\n</file>");
    out
}

#[async_trait]
impl Tool for ReadTool {
    fn id(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns up to 2000 lines with line numbers; \
         use offset and limit to page through longer files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "The path to the file to read" },
                "offset": { "type": "number", "description": "The line number to start reading from (0-based)" },
                "limit": { "type": "number", "description": "The number of lines to read (defaults to 2000)" }
            },
            "required": ["filePath"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: ReadArgs = parse_args("read", arguments)?;
        let path = self.env.resolve(ctx, "read", &args.file_path)?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "read".into(),
            reason: format!("File not found or unreadable: {} ({e})", path.display()),
        })?;
        if bytes.iter().take(8192).any(|b| *b == 0) {
            return Err(ToolError::ExecutionFailed {
                tool_name: "read".into(),
                reason: format!("Cannot read binary file: {}", path.display()),
            });
        }
        let content = String::from_utf8_lossy(&bytes);
        let offset = args.offset.unwrap_or(0);
        let limit = args.limit.unwrap_or(DEFAULT_READ_LIMIT);
        let output = render_lines(&content, offset, limit);

        let preview: String = content.lines().take(20).collect::<Vec<_>>().join("\n");
        Ok(ToolOutput::new(self.env.relative(&path), output)
            .with_metadata(serde_json::json!({ "preview": preview })))
    }
}
