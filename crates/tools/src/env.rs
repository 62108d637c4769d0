//! What every built-in tool shares: the working directory, the path policy,
//! the permission service and the audit log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use corvid_core::agent::Permission;
use corvid_core::error::ToolError;
use corvid_core::id::{IdKind, ascending};
use corvid_core::permission::{PermissionRequest, PermissionService};
use corvid_core::tool::ToolContext;
use corvid_security::{AuditEvent, AuditLogger, AuditOutcome, PathPolicy};
use serde::de::DeserializeOwned;
use tracing::warn;

pub struct ToolEnv {
    pub cwd: PathBuf,
    pub paths: PathPolicy,
    pub permissions: Arc<dyn PermissionService>,
    audit: Option<Arc<AuditLogger>>,
}

impl ToolEnv {
    pub fn new(cwd: impl Into<PathBuf>, paths: PathPolicy, permissions: Arc<dyn PermissionService>) -> Self {
        Self {
            cwd: cwd.into(),
            paths,
            permissions,
            audit: None,
        }
    }

    /// Record refused paths in `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Resolve a tool-supplied path, refusing anything the policy forbids.
    pub fn resolve(&self, ctx: &ToolContext, tool: &str, raw: &str) -> Result<PathBuf, ToolError> {
        self.paths.resolve(&self.cwd, raw).map_err(|e| {
            warn!(tool, path = raw, error = %e, "Path refused");
            if let Some(audit) = &self.audit {
                audit.log(
                    AuditEvent::PathDenied { tool: tool.to_string() },
                    &ctx.session_id,
                    raw,
                    AuditOutcome::Denied,
                    Some(e.to_string()),
                );
            }
            ToolError::SandboxViolation(e.to_string())
        })
    }

    /// `path` relative to the working directory when it lies beneath it.
    pub fn relative(&self, path: &Path) -> String {
        let base = self.cwd.canonicalize().unwrap_or_else(|_| self.cwd.clone());
        path.strip_prefix(&base)
            .or_else(|_| path.strip_prefix(&self.cwd))
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// Put a question to the permission service on behalf of `ctx`'s call.
    pub async fn ask(
        &self,
        ctx: &ToolContext,
        kind: &str,
        patterns: Vec<String>,
        title: String,
        metadata: serde_json::Value,
    ) -> Result<(), ToolError> {
        let request = PermissionRequest {
            id: ascending(IdKind::Permission),
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            call_id: Some(ctx.call_id.clone()),
            kind: kind.to_string(),
            patterns,
            title,
            metadata,
        };
        self.permissions.ask(request, &ctx.abort).await?;
        Ok(())
    }

    /// Apply the agent's edit permission to a change of `path`.
    pub async fn guard_edit(&self, ctx: &ToolContext, path: &Path, diff_hint: serde_json::Value) -> Result<(), ToolError> {
        match ctx.permissions.edit {
            Permission::Allow => Ok(()),
            Permission::Deny => Err(ToolError::ExecutionFailed {
                tool_name: "edit".into(),
                reason: format!("Editing is not permitted for agent {}", ctx.agent),
            }),
            Permission::Ask => {
                let shown = self.relative(path);
                self.ask(ctx, "edit", vec![shown.clone()], format!("Edit this file: {shown}"), diff_hint)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for ToolEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEnv")
            .field("cwd", &self.cwd)
            .field("paths", &self.paths)
            .finish()
    }
}

/// Deserialize tool arguments, reporting schema mismatches as invalid arguments.
pub fn parse_args<T: DeserializeOwned>(tool: &str, arguments: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(format!("{tool}: {e}")))
}
