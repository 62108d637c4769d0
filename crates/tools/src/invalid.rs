//! The `invalid` tool: where unresolvable tool calls are routed.
//!
//! Never offered to the model. The tool pipeline substitutes it when a call
//! names an unknown tool or carries arguments that fail to parse, so the
//! model reads the problem back as an ordinary tool result.

use async_trait::async_trait;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};

pub const INVALID_TOOL_ID: &str = "invalid";

pub struct InvalidTool;

#[async_trait]
impl Tool for InvalidTool {
    fn id(&self) -> &str {
        INVALID_TOOL_ID
    }

    fn description(&self) -> &str {
        "Do not use"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tool": { "type": "string" },
                "error": { "type": "string" }
            },
            "required": ["tool", "error"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let error = arguments["error"].as_str().unwrap_or("unknown error");
        Ok(ToolOutput::new(
            "Invalid Tool",
            format!("The arguments provided to the tool are invalid: {error}"),
        ))
    }
}
