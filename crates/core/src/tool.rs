//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the workspace:
//! execute shell commands, read and write files, search, or delegate
//! to a sub-agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentPermission;
use crate::error::{Error, ToolError};
use crate::provider::ToolDefinition;

/// The result of a successful tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Short human-readable summary shown alongside the call.
    pub title: String,

    /// Text returned to the model.
    pub output: String,

    /// Structured data for observers; never sent to the model.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ToolOutput {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A live progress report from a running tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub metadata: serde_json::Value,
}

/// Receives progress reports for one tool call.
pub type MetadataSink = Arc<dyn Fn(MetadataUpdate) + Send + Sync>;

/// Everything a tool may know about the call it is serving.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    pub agent: String,
    pub permissions: AgentPermission,
    pub abort: CancellationToken,
    pub extra: serde_json::Value,
    pub subagents: Option<Arc<dyn SubagentRunner>>,
    metadata: MetadataSink,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            call_id: call_id.into(),
            agent: agent.into(),
            permissions: AgentPermission::default(),
            abort,
            extra: serde_json::Value::Null,
            subagents: None,
            metadata: Arc::new(|_| {}),
        }
    }

    pub fn with_permissions(mut self, permissions: AgentPermission) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_metadata_sink(mut self, sink: MetadataSink) -> Self {
        self.metadata = sink;
        self
    }

    pub fn with_subagents(mut self, runner: Arc<dyn SubagentRunner>) -> Self {
        self.subagents = Some(runner);
        self
    }

    /// Report progress for the running call.
    pub fn report(&self, title: Option<String>, metadata: serde_json::Value) {
        (self.metadata)(MetadataUpdate { title, metadata });
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("call_id", &self.call_id)
            .field("agent", &self.agent)
            .finish()
    }
}

/// The core Tool trait.
///
/// Each built-in tool implements this trait. Tools are registered in the
/// [`ToolRegistry`] and offered to the model through the session's tool
/// pipeline.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique id of this tool (e.g., "bash", "read").
    fn id(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available built-in tools, ordered by id.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same id.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    /// Get a tool by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    /// All tools in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    /// List all registered tool ids.
    pub fn ids(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A request to run a sub-agent in a child session.
#[derive(Debug, Clone)]
pub struct SubagentRequest {
    pub parent_session_id: String,
    pub agent: String,
    pub description: String,
    pub prompt: String,
    pub abort: CancellationToken,
}

/// What a finished sub-agent run hands back to the delegating tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentOutput {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Runs delegated sub-agent sessions on behalf of the `task` tool.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    /// Create the child session up front so callers can report it.
    async fn create_child(&self, parent_session_id: &str, description: &str) -> Result<String, Error>;

    /// Run `request` to completion in the child session `session_id`.
    async fn run_subagent(&self, session_id: &str, request: SubagentRequest) -> Result<SubagentOutput, Error>;
}
