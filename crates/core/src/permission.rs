//! Permission service trait.
//!
//! Tools ask before doing something the agent's permission table marks as
//! `ask`. The call suspends until a reply arrives; other tool calls and the
//! session keep running.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PermissionError;

/// A question put to whoever approves tool actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Category, e.g. "bash" or "edit".
    pub kind: String,
    /// Patterns an `always` reply will remember.
    #[serde(default)]
    pub patterns: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

impl PermissionResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Suspend until the request is allowed. A rejection, or cancellation of
    /// `abort`, yields `PermissionError::Rejected`.
    async fn ask(&self, request: PermissionRequest, abort: &CancellationToken) -> Result<(), PermissionError>;
}
