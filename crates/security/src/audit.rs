//! Audit trail for permission decisions and sandbox refusals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// Session that triggered the event.
    pub session_id: String,
    /// What the decision was about: a command, a path, a tool id.
    pub target: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A tool asked for approval.
    PermissionAsked { kind: String },
    /// A reply arrived (or was implied by an earlier `always`).
    PermissionReplied { kind: String, response: String },
    /// Waiting was cut short by cancellation.
    PermissionCancelled { kind: String },
    /// A file tool was refused by path validation.
    PathDenied { tool: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Pending,
    Allowed,
    Denied,
}

/// Where audit entries are written besides the in-memory log.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Keeps every entry in memory and forwards each to its sinks.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
        }
    }

    /// A logger that forwards to `tracing`.
    pub fn traced() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }

    fn guard(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log(
        &self,
        event: AuditEvent,
        session_id: &str,
        target: &str,
        outcome: AuditOutcome,
        details: Option<String>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            session_id: session_id.into(),
            target: target.into(),
            outcome,
            details,
        };
        for sink in &self.sinks {
            sink.record(&entry);
        }
        self.guard().push(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.guard().clone()
    }

    /// Entries for one session, oldest first.
    pub fn for_session(&self, session_id: &str) -> Vec<AuditEntry> {
        self.guard()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.guard().len()
    }
}

/// Logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            event = ?entry.event,
            session_id = %entry.session_id,
            target = %entry.target,
            outcome = ?entry.outcome,
            details = ?entry.details,
            "audit"
        );
    }
}
