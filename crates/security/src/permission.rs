//! The permission gate: tools ask, someone answers.
//!
//! `ask` publishes `permission.asked` and parks the calling tool on a oneshot
//! until [`PermissionGate::respond`] is called for that request. An `always`
//! reply is remembered per session and kind, and also settles any other
//! pending request of the session it now covers. Only the asking tool call
//! waits; the session keeps streaming.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use corvid_core::error::PermissionError;
use corvid_core::event::{BusEvent, EventBus};
use corvid_core::permission::{PermissionRequest, PermissionResponse, PermissionService};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use crate::wildcard;

/// How asks are answered when nobody is watching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoReply {
    /// Wait for `respond`.
    #[default]
    Interactive,
    Approve,
    Reject,
}

struct Pending {
    request: PermissionRequest,
    reply: oneshot::Sender<PermissionResponse>,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<String, Pending>,
    /// session → kind → remembered patterns
    approved: HashMap<String, HashMap<String, Vec<String>>>,
}

impl GateState {
    fn covers(&self, request: &PermissionRequest) -> bool {
        let Some(remembered) = self
            .approved
            .get(&request.session_id)
            .and_then(|kinds| kinds.get(&request.kind))
        else {
            return false;
        };
        if request.patterns.is_empty() {
            return remembered.iter().any(|p| p == "*");
        }
        request
            .patterns
            .iter()
            .all(|wanted| remembered.iter().any(|p| wildcard::matches(wanted, p)))
    }
}

pub struct PermissionGate {
    bus: EventBus,
    state: Mutex<GateState>,
    audit: Arc<AuditLogger>,
    auto: AutoReply,
}

impl PermissionGate {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Mutex::new(GateState::default()),
            audit: Arc::new(AuditLogger::traced()),
            auto: AutoReply::Interactive,
        }
    }

    pub fn with_auto_reply(mut self, auto: AutoReply) -> Self {
        self.auto = auto;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut out: Vec<_> = self.state().pending.values().map(|p| p.request.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Answer a pending request. Returns false if it is unknown or already settled.
    pub fn respond(&self, session_id: &str, permission_id: &str, response: PermissionResponse) -> bool {
        let mut settled = Vec::new();
        {
            let mut state = self.state();
            let Some(entry) = state.pending.remove(permission_id) else {
                return false;
            };
            if entry.request.session_id != session_id {
                state.pending.insert(permission_id.to_string(), entry);
                return false;
            }

            if response == PermissionResponse::Always {
                let patterns = if entry.request.patterns.is_empty() {
                    vec!["*".to_string()]
                } else {
                    entry.request.patterns.clone()
                };
                state
                    .approved
                    .entry(session_id.to_string())
                    .or_default()
                    .entry(entry.request.kind.clone())
                    .or_default()
                    .extend(patterns);

                let covered: Vec<String> = state
                    .pending
                    .iter()
                    .filter(|(_, p)| state.covers(&p.request))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in covered {
                    if let Some(other) = state.pending.remove(&id) {
                        settled.push((other, PermissionResponse::Always));
                    }
                }
            }
            settled.insert(0, (entry, response));
        }

        for (entry, response) in settled {
            self.record_reply(&entry.request, response);
            let _ = entry.reply.send(response);
        }
        true
    }

    /// Drop remembered approvals and reject anything pending for a session.
    pub fn clear_session(&self, session_id: &str) {
        let mut state = self.state();
        state.approved.remove(session_id);
        state.pending.retain(|_, p| p.request.session_id != session_id);
    }

    fn record_reply(&self, request: &PermissionRequest, response: PermissionResponse) {
        self.bus.publish(BusEvent::PermissionReplied {
            session_id: request.session_id.clone(),
            permission_id: request.id.clone(),
            response: response.as_str().to_string(),
        });
        let outcome = match response {
            PermissionResponse::Reject => AuditOutcome::Denied,
            _ => AuditOutcome::Allowed,
        };
        self.audit.log(
            AuditEvent::PermissionReplied {
                kind: request.kind.clone(),
                response: response.as_str().to_string(),
            },
            &request.session_id,
            &request.title,
            outcome,
            None,
        );
    }

    fn rejected(request: &PermissionRequest) -> PermissionError {
        PermissionError::Rejected {
            session_id: request.session_id.clone(),
            permission_id: request.id.clone(),
            call_id: request.call_id.clone(),
            metadata: request.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("pending", &self.state().pending.len())
            .field("auto", &self.auto)
            .finish()
    }
}

#[async_trait]
impl PermissionService for PermissionGate {
    async fn ask(&self, request: PermissionRequest, abort: &CancellationToken) -> Result<(), PermissionError> {
        let rx = {
            let mut state = self.state();
            if state.covers(&request) {
                debug!(session_id = %request.session_id, kind = %request.kind, "Permission remembered");
                return Ok(());
            }
            match self.auto {
                AutoReply::Approve => {
                    drop(state);
                    self.record_reply(&request, PermissionResponse::Once);
                    return Ok(());
                }
                AutoReply::Reject => {
                    drop(state);
                    self.record_reply(&request, PermissionResponse::Reject);
                    return Err(Self::rejected(&request));
                }
                AutoReply::Interactive => {}
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                request.id.clone(),
                Pending {
                    request: request.clone(),
                    reply: tx,
                },
            );
            rx
        };

        info!(
            session_id = %request.session_id,
            permission_id = %request.id,
            kind = %request.kind,
            "Permission asked"
        );
        self.audit.log(
            AuditEvent::PermissionAsked {
                kind: request.kind.clone(),
            },
            &request.session_id,
            &request.title,
            AuditOutcome::Pending,
            None,
        );
        self.bus.publish(BusEvent::PermissionAsked {
            request: request.clone(),
        });

        tokio::select! {
            reply = rx => match reply {
                Ok(PermissionResponse::Once | PermissionResponse::Always) => Ok(()),
                Ok(PermissionResponse::Reject) | Err(_) => Err(Self::rejected(&request)),
            },
            _ = abort.cancelled() => {
                self.state().pending.remove(&request.id);
                self.audit.log(
                    AuditEvent::PermissionCancelled { kind: request.kind.clone() },
                    &request.session_id,
                    &request.title,
                    AuditOutcome::Denied,
                    None,
                );
                Err(Self::rejected(&request))
            }
        }
    }
}
