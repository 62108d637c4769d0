//! Generation-level stream events.
//!
//! A `GenerationEvent` is what the stream processor consumes. It wraps the
//! provider's per-step [`ModelEvent`](corvid_core::provider::ModelEvent)s and
//! adds the step boundaries and tool outcomes produced by the generation loop.

use corvid_core::error::ProviderError;
use corvid_core::provider::{FinishReason, Usage};
use corvid_core::tool::ToolOutput;

#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// The generation began.
    Start,
    /// Raised before every model step after the first. The consumer may
    /// splice in queued user turns or stop the generation here.
    PrepareStep { step: usize },
    /// A model step is about to stream.
    StartStep,

    ReasoningStart { id: String },
    ReasoningDelta { id: String, text: String },
    ReasoningEnd { id: String },

    TextStart { id: String },
    TextDelta { id: String, text: String },
    TextEnd { id: String },

    ToolInputStart { call_id: String, tool: String },
    /// The model finished the call. `tool` is the repaired name that will run.
    ToolCall {
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    /// Live progress from a running tool.
    ToolMetadata {
        call_id: String,
        title: Option<String>,
        metadata: serde_json::Value,
    },
    ToolResult { call_id: String, output: ToolOutput },
    ToolError {
        call_id: String,
        error: String,
        /// The user refused a permission ask for this call.
        rejected: bool,
        metadata: Option<serde_json::Value>,
    },

    FinishStep { usage: Usage, finish_reason: FinishReason },
    Finish,
    Error(ProviderError),
}

impl GenerationEvent {
    /// A short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PrepareStep { .. } => "prepare-step",
            Self::StartStep => "start-step",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolMetadata { .. } => "tool-metadata",
            Self::ToolResult { .. } => "tool-result",
            Self::ToolError { .. } => "tool-error",
            Self::FinishStep { .. } => "finish-step",
            Self::Finish => "finish",
            Self::Error(_) => "error",
        }
    }
}
