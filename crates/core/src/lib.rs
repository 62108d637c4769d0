//! # Corvid Core
//!
//! Domain types, collaborator traits, and error definitions for the Corvid
//! session engine. This crate has no knowledge of any concrete provider,
//! storage backend or tool; those live in their own crates and implement the
//! traits defined here.
//!
//! ## Layout
//!
//! - [`session`], [`message`]: the persisted data model
//! - [`provider`], [`storage`], [`permission`], [`mcp`], [`snapshot`]: collaborators the engine consumes
//! - [`tool`], [`hooks`], [`agent`]: what a turn is allowed to do
//! - [`event`]: the broadcast bus observers subscribe to

pub mod agent;
pub mod error;
pub mod event;
pub mod hooks;
pub mod id;
pub mod mcp;
pub mod message;
pub mod permission;
pub mod provider;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentInfo, AgentMode, AgentPermission, Permission};
pub use error::{Error, Result};
pub use event::{BusEvent, EventBus};
pub use hooks::{Hook, Hooks};
pub use message::{AssistantMessage, MessageError, MessageInfo, Part, PartKind, ToolState, UserMessage, WithParts};
pub use provider::{LanguageModel, ModelEvent, ModelInfo, ModelMessage, ModelRef, ProviderRegistry, ResolvedModel};
pub use session::Session;
pub use storage::{Storage, StorageExt};
pub use tool::{Tool, ToolContext, ToolOutput, ToolRegistry};
