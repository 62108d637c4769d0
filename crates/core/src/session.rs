//! Session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{self, IdKind};

const PARENT_TITLE_PREFIX: &str = "New session - ";
const CHILD_TITLE_PREFIX: &str = "Child session - ";

/// A persisted conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub directory: String,
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Set while a summarization is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertInfo {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

impl Session {
    /// A new session with a default title.
    pub fn new(parent_id: Option<String>, directory: impl Into<String>) -> Self {
        let now = Utc::now();
        let title = default_title(parent_id.is_some(), now);
        Self {
            id: id::ascending(IdKind::Session),
            parent_id,
            title,
            directory: directory.into(),
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
            },
            share: None,
            revert: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// The placeholder title a session gets until one is generated.
pub fn default_title(child: bool, at: DateTime<Utc>) -> String {
    let prefix = if child { CHILD_TITLE_PREFIX } else { PARENT_TITLE_PREFIX };
    format!("{prefix}{}", at.to_rfc3339())
}

pub fn is_default_title(title: &str) -> bool {
    title.starts_with(PARENT_TITLE_PREFIX) || title.starts_with(CHILD_TITLE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_default_title() {
        let session = Session::new(None, "/tmp");
        assert!(session.is_top_level());
        assert!(is_default_title(&session.title));
        assert!(session.title.starts_with("New session - "));
    }

    #[test]
    fn child_session_title() {
        let session = Session::new(Some("ses_parent".into()), "/tmp");
        assert!(!session.is_top_level());
        assert!(session.title.starts_with("Child session - "));
        assert!(!is_default_title("Fix the login bug"));
    }
}
