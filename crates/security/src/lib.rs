//! Security layer for Corvid: path sandboxing, wildcard rules, the permission gate and audit logging.
//!
//! Provides:
//! - **Path validation**: keep file tools inside allowed roots and away from forbidden paths
//! - **Wildcards**: the `*`/`?` pattern matcher used for tool switches and bash rules
//! - **Permission gate**: `ask` / reply round-trips with remembered `always` answers
//! - **Audit logging**: structured records of every permission decision

pub mod audit;
pub mod path;
pub mod permission;
pub mod wildcard;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use path::{PathPolicy, PathValidationError, validate_path};
pub use permission::{AutoReply, PermissionGate};
