//! Task tool: delegate a self-contained job to a sub-agent in a child session.

use async_trait::async_trait;
use corvid_core::agent::{AgentInfo, AgentMode};
use corvid_core::error::ToolError;
use corvid_core::tool::{SubagentRequest, Tool, ToolContext, ToolOutput};
use serde::Deserialize;
use tracing::info;

use crate::env::parse_args;

#[derive(Debug, Deserialize)]
struct TaskArgs {
    description: String,
    prompt: String,
    subagent_type: String,
}

pub struct TaskTool {
    description: String,
    subagents: Vec<String>,
}

impl TaskTool {
    /// Offer every agent that may run as a sub-agent.
    pub fn new(agents: &[AgentInfo]) -> Self {
        let eligible: Vec<&AgentInfo> = agents.iter().filter(|a| a.mode != AgentMode::Primary).collect();
        let mut description = String::from(
            "Launch a new agent to handle a complex, multi-step task autonomously.\n\nAvailable agent types:\n",
        );
        for agent in &eligible {
            description.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }
        Self {
            description,
            subagents: eligible.iter().map(|a| a.name.clone()).collect(),
        }
    }
}

fn failed(reason: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "task".into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn id(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": { "type": "string", "description": "A short (3-5 words) description of the task" },
                "prompt": { "type": "string", "description": "The task for the agent to perform" },
                "subagent_type": { "type": "string", "enum": self.subagents }
            },
            "required": ["description", "prompt", "subagent_type"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: TaskArgs = parse_args("task", arguments)?;
        if !self.subagents.contains(&args.subagent_type) {
            return Err(failed(format!("Unknown agent type: {}", args.subagent_type)));
        }
        let runner = ctx
            .subagents
            .clone()
            .ok_or_else(|| failed("Sub-agents are not available in this context"))?;

        let child = runner
            .create_child(&ctx.session_id, &args.description)
            .await
            .map_err(|e| failed(e.to_string()))?;
        info!(parent = %ctx.session_id, child = %child, agent = %args.subagent_type, "Delegating task");
        ctx.report(
            Some(args.description.clone()),
            serde_json::json!({ "sessionId": child }),
        );

        let result = runner
            .run_subagent(
                &child,
                SubagentRequest {
                    parent_session_id: ctx.session_id.clone(),
                    agent: args.subagent_type.clone(),
                    description: args.description.clone(),
                    prompt: args.prompt,
                    abort: ctx.abort.clone(),
                },
            )
            .await
            .map_err(|e| failed(e.to_string()))?;

        if let Some(error) = result.error {
            return Err(failed(error));
        }
        Ok(ToolOutput::new(args.description, result.text)
            .with_metadata(serde_json::json!({ "sessionId": result.session_id })))
    }
}
