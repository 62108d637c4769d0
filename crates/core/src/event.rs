//! Domain event system: decoupled communication between the engine and its observers.
//!
//! Every persisted write publishes an event carrying the whole new record,
//! so subscribers never need to read storage to stay current.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::{MessageError, MessageInfo, Part};
use crate::permission::PermissionRequest;
use crate::session::Session;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum BusEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },

    #[serde(rename = "session.deleted")]
    SessionDeleted { info: Session },

    /// A generation ended with a classified error.
    #[serde(rename = "session.error")]
    SessionError {
        session_id: Option<String>,
        error: MessageError,
    },

    /// A top-level session released its lock.
    #[serde(rename = "session.idle")]
    SessionIdle { session_id: String },

    #[serde(rename = "session.compacted")]
    SessionCompacted { session_id: String },

    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },

    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: String,
        message_id: String,
    },

    /// `delta` carries the appended text for streaming text/reasoning writes.
    #[serde(rename = "message.part.updated")]
    PartUpdated {
        part: Part,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },

    #[serde(rename = "permission.asked")]
    PermissionAsked { request: PermissionRequest },

    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: String,
    },
}

impl BusEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionError { .. } => "session.error",
            Self::SessionIdle { .. } => "session.idle",
            Self::SessionCompacted { .. } => "session.compacted",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::PartUpdated { .. } => "message.part.updated",
            Self::PermissionAsked { .. } => "permission.asked",
            Self::PermissionReplied { .. } => "permission.replied",
        }
    }
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Slow subscribers lag and lose old events; publishers never block.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<BusEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: BusEvent) {
        tracing::trace!(event = event.name(), "publish");
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BusEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
