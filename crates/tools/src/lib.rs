//! Built-in tool implementations for Corvid.
//!
//! Tools give the agent the ability to work in the workspace: run shell
//! commands, read, write and edit files, search the tree, and delegate to
//! sub-agents. Every path-taking tool resolves paths through the shared
//! [`ToolEnv`], which applies the security crate's path policy.

pub mod bash;
pub mod edit;
pub mod env;
pub mod invalid;
pub mod list;
pub mod process;
pub mod read;
pub mod task;
pub mod write;

use std::sync::Arc;

use corvid_core::agent::AgentInfo;
use corvid_core::tool::ToolRegistry;

pub use env::ToolEnv;
pub use invalid::INVALID_TOOL_ID;
pub use process::{ProcessEnd, ProcessOutcome, run_streaming};

/// Create a registry holding every built-in tool.
///
/// `agents` feeds the `task` tool's list of delegatable agents.
pub fn default_registry(env: Arc<ToolEnv>, agents: &[AgentInfo]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(bash::BashTool::new(env.clone())));
    registry.register(Arc::new(read::ReadTool::new(env.clone())));
    registry.register(Arc::new(write::WriteTool::new(env.clone())));
    registry.register(Arc::new(edit::EditTool::new(env.clone())));
    registry.register(Arc::new(list::ListTool::new(env.clone())));
    registry.register(Arc::new(list::GrepTool::new(env)));
    registry.register(Arc::new(invalid::InvalidTool));
    registry.register(Arc::new(task::TaskTool::new(agents)));
    registry
}
