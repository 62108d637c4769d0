//! Provider traits: the abstraction over LLM backends.
//!
//! A [`LanguageModel`] runs exactly one model step: it takes the conversation
//! so far and streams back [`ModelEvent`]s until the step finishes. Looping
//! over steps, executing tools and feeding results back is the engine's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ProviderError;

/// A `provider/model` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parse `provider/model`. The model part may itself contain slashes.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Context and output limits, in tokens. Zero means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelLimit {
    pub context: u64,
    pub output: u64,
}

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// Capability metadata for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub limit: ModelLimit,
    #[serde(default)]
    pub cost: ModelCost,
    #[serde(default = "default_true")]
    pub tool_call: bool,
    #[serde(default)]
    pub reasoning: bool,
    /// Whether the model accepts a temperature parameter.
    #[serde(default = "default_true")]
    pub temperature: bool,
}

fn default_true() -> bool {
    true
}

impl ModelInfo {
    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(&self.provider_id, &self.id)
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// User-side content of a model message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text { text: String },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

/// Assistant-side content of a model message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text { text: String },
    Reasoning { text: String },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    pub call_id: String,
    pub tool_name: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// One message of a model-ready conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    System { content: String },
    User { content: Vec<UserContent> },
    Assistant { content: Vec<AssistantContent> },
    Tool { content: Vec<ToolResultContent> },
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { content: text.into() }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![UserContent::Text { text: text.into() }],
        }
    }
}

/// Everything a model needs to run one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ModelMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    /// Provider-specific options merged from agent and hooks.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Token usage reported at the end of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Other => "other",
        }
    }
}

/// Events a model emits while running one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModelEvent {
    TextStart { id: String },
    TextDelta { id: String, text: String },
    TextEnd { id: String },
    ReasoningStart { id: String },
    ReasoningDelta { id: String, text: String },
    ReasoningEnd { id: String },
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, delta: String },
    /// A complete tool call. `input` is the raw JSON text the model produced.
    ToolCall { id: String, tool_name: String, input: String },
    Finish { reason: FinishReason, usage: Usage },
}

/// The receiving end of one model step.
pub type ModelStream = mpsc::Receiver<Result<ModelEvent, ProviderError>>;

/// The core LanguageModel trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider-side model id.
    fn id(&self) -> &str;

    /// Start one step. Errors before the first event are returned directly;
    /// errors mid-stream arrive as `Err` items on the channel.
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ProviderError>;
}

/// A model handle plus its capability metadata.
#[derive(Clone)]
pub struct ResolvedModel {
    pub info: ModelInfo,
    pub language: Arc<dyn LanguageModel>,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel").field("info", &self.info).finish()
    }
}

/// Resolves model handles by provider and model id.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn model(&self, model: &ModelRef) -> Result<ResolvedModel, ProviderError>;

    /// A cheaper model for side tasks such as titles, if the provider has one.
    async fn small_model(&self, provider_id: &str) -> Option<ResolvedModel>;

    /// The default model when neither input nor agent names one.
    fn default_model(&self) -> Option<ModelRef>;
}
