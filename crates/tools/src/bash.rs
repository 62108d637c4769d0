//! Bash tool: run a command line in the workspace.
//!
//! Each simple command of the line (split on `&&`, `||`, `;` and `|`) is
//! checked against the agent's bash rules. Output streams into the call's
//! metadata while the command runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corvid_core::agent::Permission;
use corvid_core::error::ToolError;
use corvid_core::tool::{Tool, ToolContext, ToolOutput};
use corvid_security::wildcard;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::env::{ToolEnv, parse_args};
use crate::process::{ProcessEnd, run_streaming, shell_command};

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const MAX_TIMEOUT_MS: u64 = 10 * 60_000;
pub const MAX_OUTPUT_CHARS: usize = 30_000;

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    description: Option<String>,
}

pub struct BashTool {
    env: Arc<ToolEnv>,
}

impl BashTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

/// The simple commands of a command line.
fn split_commands(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ';' | '\n') => out.push(std::mem::take(&mut current)),
            (None, '&') if chars.peek() == Some(&'&') => {
                chars.next();
                out.push(std::mem::take(&mut current));
            }
            (None, '|') => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                out.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    out.push(current);
    out.into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn truncate(mut output: String) -> String {
    if output.chars().count() <= MAX_OUTPUT_CHARS {
        return output;
    }
    let cut = output
        .char_indices()
        .nth(MAX_OUTPUT_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    output.truncate(cut);
    output.push_str("\n\n(Output was truncated due to length limit)");
    output
}

#[async_trait]
impl Tool for BashTool {
    fn id(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in the workspace and return its combined stdout/stderr. \
         Use for builds, tests, git and other terminal work. Timeout defaults to 60000 ms \
         and may be raised to 600000 ms."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command to execute" },
                "timeout": { "type": "number", "description": "Optional timeout in milliseconds" },
                "description": {
                    "type": "string",
                    "description": "Clear, concise description of what this command does in 5-10 words"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: BashArgs = parse_args("bash", arguments)?;
        let timeout_ms = args.timeout.unwrap_or(DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
        let description = args.description.clone().unwrap_or_default();

        let mut needs_approval = Vec::new();
        for simple in split_commands(&args.command) {
            match wildcard::resolve(&simple, &ctx.permissions.bash).copied().unwrap_or_default() {
                Permission::Allow => {}
                Permission::Ask => needs_approval.push(simple),
                Permission::Deny => {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: "bash".into(),
                        reason: format!("The user has specifically restricted access to this command: {simple}"),
                    });
                }
            }
        }
        if !needs_approval.is_empty() {
            self.env
                .ask(
                    ctx,
                    "bash",
                    needs_approval,
                    args.command.clone(),
                    serde_json::json!({ "command": args.command }),
                )
                .await?;
        }

        debug!(command = %args.command, timeout_ms, "Executing bash command");
        ctx.report(
            Some(description.clone()),
            serde_json::json!({ "output": "", "description": description }),
        );

        let mut command = shell_command(&args.command);
        command.current_dir(&self.env.cwd);
        let outcome = run_streaming(command, Some(Duration::from_millis(timeout_ms)), &ctx.abort, |live| {
            ctx.report(
                None,
                serde_json::json!({ "output": truncate(live.to_string()), "description": description }),
            );
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "bash".into(),
            reason: e.to_string(),
        })?;

        let mut output = truncate(outcome.output);
        let exit = match outcome.end {
            ProcessEnd::Exited(code) => code,
            ProcessEnd::TimedOut => {
                warn!(command = %args.command, timeout_ms, "Command timed out");
                output.push_str(&format!("\n\n(Command timed out after {timeout_ms} ms)"));
                None
            }
            ProcessEnd::Aborted => {
                output.push_str("\n\n(Command was aborted)");
                None
            }
        };

        let title = if description.is_empty() { args.command.clone() } else { description.clone() };
        Ok(ToolOutput::new(title, output.clone()).with_metadata(serde_json::json!({
            "output": output,
            "exit": exit,
            "description": description,
        })))
    }
}
