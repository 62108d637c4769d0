//! Remote tool sources (MCP servers).
//!
//! The engine only needs two things from a client manager: the list of tools
//! each connected server offers, and a way to call one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// A tool offered by a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    /// The client (server) name as configured.
    pub server: String,
    /// The tool name as the server reports it.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One block of a remote tool's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Resource { uri: String },
}

#[async_trait]
pub trait McpClients: Send + Sync {
    /// Tools across all connected servers.
    async fn tools(&self) -> Result<Vec<RemoteTool>, ToolError>;

    /// Invoke `tool` on `server`.
    async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        abort: &CancellationToken,
    ) -> Result<Vec<RemoteContent>, ToolError>;
}
