//! Tool pipeline: decides which tools a turn may use and runs them.
//!
//! Enablement merges, lowest precedence first: the global `tools` table from
//! config, the agent's own tool flags, defaults derived from the agent's
//! permissions, and the caller's per-prompt overrides. Keys may be globs.
//!
//! Every call goes through the hook chain (`tool_before`, execute,
//! `tool_after`). Remote MCP tools are adapted into ordinary [`Tool`]s so
//! they take the same path.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use corvid_core::agent::{AgentInfo, Permission};
use corvid_core::error::ToolError;
use corvid_core::hooks::{Hooks, ToolHookContext};
use corvid_core::mcp::{McpClients, RemoteContent, RemoteTool};
use corvid_core::provider::{ModelInfo, ToolDefinition};
use corvid_core::tool::{Tool, ToolContext, ToolOutput, ToolRegistry};
use corvid_security::wildcard;
use corvid_tools::INVALID_TOOL_ID;
use corvid_tools::invalid::InvalidTool;
use regex_lite::Regex;
use tracing::{debug, warn};

/// Merge tool flags for one turn. Later layers override earlier ones.
pub fn enabled_tools(
    global: &BTreeMap<String, bool>,
    agent: &AgentInfo,
    overrides: &BTreeMap<String, bool>,
) -> BTreeMap<String, bool> {
    let mut merged = global.clone();
    merged.extend(agent.tools.iter().map(|(k, v)| (k.clone(), *v)));

    merged.insert("patch".into(), false);
    if agent.permission.edit == Permission::Deny {
        for id in ["edit", "write", "patch"] {
            merged.insert(id.into(), false);
        }
    }
    if agent.permission.denies_all_bash() {
        merged.insert("bash".into(), false);
    }
    if agent.permission.webfetch == Permission::Deny {
        merged.insert("webfetch".into(), false);
    }

    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
    merged
}

/// Whether `tool_id` is on under `flags`. Tools nobody mentions are on.
pub fn is_enabled(tool_id: &str, flags: &BTreeMap<String, bool>) -> bool {
    wildcard::resolve(tool_id, flags).copied().unwrap_or(true)
}

/// `server_tool` with whitespace and dashes folded to underscores.
pub fn remote_tool_id(server: &str, tool: &str) -> String {
    static SERVER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());
    static TOOL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[-\s]+").ok());
    let fold = |re: &Option<Regex>, s: &str| match re {
        Some(re) => re.replace_all(s, "_").into_owned(),
        None => s.to_string(),
    };
    format!("{}_{}", fold(&SERVER, server), fold(&TOOL, tool))
}

/// An MCP tool presented as a local one.
struct RemoteToolAdapter {
    id: String,
    remote: RemoteTool,
    clients: Arc<dyn McpClients>,
}

#[async_trait]
impl Tool for RemoteToolAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.remote.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.remote.parameters.clone()
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let content = self
            .clients
            .call(&self.remote.server, &self.remote.name, arguments, &ctx.abort)
            .await?;
        let output = content
            .iter()
            .filter_map(|block| match block {
                RemoteContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput::new("", output).with_metadata(serde_json::json!({})))
    }
}

/// Builds the per-turn tool set.
#[derive(Clone)]
pub struct ToolPipeline {
    builtins: ToolRegistry,
    mcp: Option<Arc<dyn McpClients>>,
    hooks: Hooks,
    global: BTreeMap<String, bool>,
}

impl ToolPipeline {
    pub fn new(builtins: ToolRegistry) -> Self {
        Self {
            builtins,
            mcp: None,
            hooks: Hooks::new(),
            global: BTreeMap::new(),
        }
    }

    pub fn with_mcp(mut self, clients: Arc<dyn McpClients>) -> Self {
        self.mcp = Some(clients);
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_global(mut self, flags: BTreeMap<String, bool>) -> Self {
        self.global = flags;
        self
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Every built-in tool, regardless of agent or model.
    pub fn builtins(&self) -> &ToolRegistry {
        &self.builtins
    }

    /// The tools offered for one turn of `agent` on `model`.
    pub async fn resolve(
        &self,
        agent: &AgentInfo,
        model: &ModelInfo,
        overrides: &BTreeMap<String, bool>,
    ) -> ResolvedTools {
        let flags = enabled_tools(&self.global, agent, overrides);
        let mut tools = ToolRegistry::new();

        if model.tool_call {
            for tool in self.builtins.iter() {
                if tool.id() != INVALID_TOOL_ID && is_enabled(tool.id(), &flags) {
                    tools.register(tool.clone());
                }
            }
            if let Some(clients) = &self.mcp {
                match clients.tools().await {
                    Ok(remote) => {
                        for remote in remote {
                            let id = remote_tool_id(&remote.server, &remote.name);
                            if is_enabled(&id, &flags) {
                                tools.register(Arc::new(RemoteToolAdapter {
                                    id,
                                    remote,
                                    clients: clients.clone(),
                                }));
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to list remote tools"),
                }
            }
        }
        debug!(agent = %agent.name, tools = ?tools.ids(), "Resolved tools");
        tools.register(Arc::new(InvalidTool));

        ResolvedTools {
            tools,
            hooks: self.hooks.clone(),
        }
    }
}

/// The tools of one turn, ready to be invoked.
#[derive(Clone)]
pub struct ResolvedTools {
    tools: ToolRegistry,
    hooks: Hooks,
}

impl ResolvedTools {
    /// A tool set that offers nothing. Stray calls still land on `invalid`.
    pub fn none() -> Self {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(InvalidTool));
        Self {
            tools,
            hooks: Hooks::new(),
        }
    }

    /// Definitions sent to the model. The `invalid` sink is never offered.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| t.id() != INVALID_TOOL_ID)
            .map(|t| t.to_definition())
            .collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.tools.ids()
    }

    /// Map a model's call onto a tool that exists.
    ///
    /// A case-only mismatch is fixed by lower-casing. Anything else, or
    /// arguments that are not valid JSON, is routed to the `invalid` tool.
    pub fn repair(&self, name: &str, raw_input: &str) -> (String, serde_json::Value) {
        let resolved = if self.tools.get(name).is_some() && name != INVALID_TOOL_ID {
            Some(name.to_string())
        } else {
            let lower = name.to_lowercase();
            (self.tools.get(&lower).is_some() && lower != INVALID_TOOL_ID).then_some(lower)
        };

        let Some(tool) = resolved else {
            let available: Vec<&str> = self.tools.ids().into_iter().filter(|id| *id != INVALID_TOOL_ID).collect();
            warn!(tool = name, "Model called an unavailable tool");
            return (
                INVALID_TOOL_ID.to_string(),
                serde_json::json!({
                    "tool": name,
                    "error": format!(
                        "Model tried to call unavailable tool '{name}'. Available tools: {}.",
                        available.join(", ")
                    ),
                }),
            );
        };

        let raw = if raw_input.trim().is_empty() { "{}" } else { raw_input };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(input) => (tool, input),
            Err(e) => {
                warn!(tool = %tool, error = %e, "Tool call arguments are not valid JSON");
                (
                    INVALID_TOOL_ID.to_string(),
                    serde_json::json!({ "tool": tool, "error": e.to_string() }),
                )
            }
        }
    }

    /// Run one call through the hook chain.
    pub async fn invoke(
        &self,
        tool_id: &str,
        mut input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(tool_id)
            .ok_or_else(|| ToolError::NotFound(tool_id.to_string()))?;
        let hook_ctx = ToolHookContext {
            tool: tool_id.to_string(),
            session_id: ctx.session_id.clone(),
            call_id: ctx.call_id.clone(),
        };
        self.hooks.tool_before(&hook_ctx, &mut input)?;
        let mut output = tool.execute(input, ctx).await?;
        self.hooks.tool_after(&hook_ctx, &mut output);
        Ok(output)
    }
}
