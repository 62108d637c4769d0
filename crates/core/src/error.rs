//! Error types for the Corvid domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use std::collections::BTreeMap;
use thiserror::Error;

/// The top-level error type for all Corvid operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Permission errors ---
    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code:?})")]
    ApiError {
        status_code: Option<u16>,
        message: String,
        retryable: bool,
        /// Response headers, lower-cased. Carries retry hints.
        headers: BTreeMap<String, String>,
    },

    #[error("Authentication failed for {provider_id}: {message}")]
    AuthenticationFailed { provider_id: String, message: String },

    #[error("Output length limit reached")]
    OutputLength,

    #[error("Model not found: {provider_id}/{model_id}")]
    ModelNotFound { provider_id: String, model_id: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request aborted")]
    Aborted,
}

impl ProviderError {
    /// Build a retryable API error from a status and response headers.
    pub fn api(status_code: u16, message: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self::ApiError {
            status_code: Some(status_code),
            message: message.into(),
            retryable: status_code == 429 || status_code >= 500,
            headers,
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApiError { retryable, .. } => *retryable,
            Self::StreamInterrupted(_) | Self::Timeout(_) | Self::Network(_) => true,
            _ => false,
        }
    }

    /// Response headers attached to the error, if any.
    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::ApiError { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("The user rejected permission to use this specific tool call: {reason}")]
    PermissionRejected {
        reason: String,
        #[source]
        source: Option<PermissionError>,
        metadata: serde_json::Value,
    },

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool call vetoed by hook {hook}: {reason}")]
    Vetoed { hook: String, reason: String },

    #[error("Tool execution aborted")]
    Aborted,
}

impl ToolError {
    /// A permission rejection ends the generation after the current step.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::PermissionRejected { .. })
    }
}

impl From<PermissionError> for ToolError {
    fn from(err: PermissionError) -> Self {
        let metadata = match &err {
            PermissionError::Rejected { metadata, .. } => metadata.clone(),
        };
        Self::PermissionRejected {
            reason: err.to_string(),
            metadata,
            source: Some(err),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O failure at {key}: {reason}")]
    Io { key: String, reason: String },

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session {0} is busy")]
    Busy(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Queued prompt for session {0} was dropped before it ran")]
    QueueDropped(String),
}

#[derive(Debug, Clone, Error)]
pub enum PermissionError {
    #[error("permission {permission_id} rejected for session {session_id}")]
    Rejected {
        session_id: String,
        permission_id: String,
        call_id: Option<String>,
        metadata: serde_json::Value,
    },
}
