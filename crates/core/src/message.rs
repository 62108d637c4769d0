//! Message and Part domain types.
//!
//! A session is an ordered list of messages. Each message is an ordered list
//! of parts. Both are persisted as whole records keyed by their ascending id,
//! so document order is id order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{self, IdKind};
use crate::provider::ModelRef;

/// Token accounting for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheTokens,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    pub read: u64,
    pub write: u64,
}

impl Tokens {
    /// Tokens that occupy the context window: input, cached reads and output.
    pub fn context_total(&self) -> u64 {
        self.input + self.cache.read + self.output
    }

    /// Fold a step's usage into a running aggregate without ever decreasing a field.
    pub fn absorb(&mut self, step: &Tokens) {
        self.input = self.input.max(step.input);
        self.output = self.output.max(step.output);
        self.reasoning = self.reasoning.max(step.reasoning);
        self.cache.read = self.cache.read.max(step.cache.read);
        self.cache.write = self.cache.write.max(step.cache.write);
    }
}

/// Structured failure attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum MessageError {
    #[serde(rename = "MessageAbortedError")]
    Aborted { message: String },
    #[serde(rename = "MessageOutputLengthError")]
    OutputLength,
    #[serde(rename = "ProviderAuthError")]
    Auth { provider_id: String, message: String },
    #[serde(rename = "APIError")]
    Api {
        message: String,
        status_code: Option<u16>,
        retryable: bool,
    },
    #[serde(rename = "UnknownError")]
    Unknown { message: String },
}

impl MessageError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted { message } => write!(f, "aborted: {message}"),
            Self::OutputLength => write!(f, "output length exceeded"),
            Self::Auth { provider_id, message } => write!(f, "auth error ({provider_id}): {message}"),
            Self::Api { message, status_code, .. } => match status_code {
                Some(code) => write!(f, "api error {code}: {message}"),
                None => write!(f, "api error: {message}"),
            },
            Self::Unknown { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl MessageTime {
    pub fn now() -> Self {
        Self {
            created: Utc::now(),
            completed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub session_id: String,
    pub time: MessageTime,
    pub agent: String,
    pub model: ModelRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePath {
    pub cwd: String,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    pub time: MessageTime,
    /// The user message this assistant message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub system: Vec<String>,
    /// Agent name the message was generated under.
    pub mode: String,
    #[serde(default)]
    pub path: MessagePath,
    pub provider_id: String,
    pub model_id: String,
    pub cost: f64,
    pub tokens: Tokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
}

impl AssistantMessage {
    /// A fresh, empty assistant message in `session_id`.
    pub fn new(session_id: impl Into<String>, mode: impl Into<String>, model: &ModelRef) -> Self {
        Self {
            id: id::ascending(IdKind::Message),
            session_id: session_id.into(),
            time: MessageTime::now(),
            parent_id: None,
            system: Vec::new(),
            mode: mode.into(),
            path: MessagePath::default(),
            provider_id: model.provider_id.clone(),
            model_id: model.model_id.clone(),
            cost: 0.0,
            tokens: Tokens::default(),
            error: None,
            summary: false,
            finish: None,
        }
    }
}

/// Either side of a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageInfo {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl MessageInfo {
    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::User(m) => &m.session_id,
            Self::Assistant(m) => &m.session_id,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            Self::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Self::User(m) => Some(m),
            Self::Assistant(_) => None,
        }
    }

    pub fn is_summary(&self) -> bool {
        self.as_assistant().is_some_and(|m| m.summary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartTime {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl PartTime {
    pub fn started() -> Self {
        Self {
            start: Utc::now(),
            end: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub text: String,
    pub time: PartTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTime {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Set once when the output is pruned; never cleared afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<DateTime<Utc>>,
}

/// Lifecycle of a tool call: `pending -> running -> {completed, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: serde_json::Value,
        #[serde(default)]
        raw: String,
    },
    Running {
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        time: ToolTime,
    },
    Completed {
        input: serde_json::Value,
        output: String,
        title: String,
        metadata: serde_json::Value,
        time: ToolTime,
    },
    Error {
        input: serde_json::Value,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        time: ToolTime,
    },
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn input(&self) -> &serde_json::Value {
        match self {
            Self::Pending { input, .. }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePart {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPart {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishPart {
    pub tokens: Tokens,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPart {
    pub hash: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPart {
    pub auto: bool,
}

/// The payload of a part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartKind {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    File(FilePart),
    Agent(AgentPart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
    Patch(PatchPart),
    Compaction(CompactionPart),
}

/// An ordered fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    /// A new part with a fresh ascending id.
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>, kind: PartKind) -> Self {
        Self {
            id: id::ascending(IdKind::Part),
            session_id: session_id.into(),
            message_id: message_id.into(),
            kind,
        }
    }

    /// A finished text part.
    pub fn text(session_id: &str, message_id: &str, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            message_id,
            PartKind::Text(TextPart {
                text: text.into(),
                synthetic: false,
                time: None,
            }),
        )
    }

    /// A text part the user did not type.
    pub fn synthetic(session_id: &str, message_id: &str, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            message_id,
            PartKind::Text(TextPart {
                text: text.into(),
                synthetic: true,
                time: None,
            }),
        )
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match &self.kind {
            PartKind::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextPart> {
        match &self.kind {
            PartKind::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A message together with its parts, in id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithParts {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl WithParts {
    /// Concatenated text of all non-synthetic text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .filter(|t| !t.synthetic)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
