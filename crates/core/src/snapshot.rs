//! Workspace snapshot collaborator.
//!
//! The engine asks for a snapshot before each model step and for the list of
//! changed files after it. How snapshots are taken is not its concern.

use async_trait::async_trait;

#[async_trait]
pub trait Snapshot: Send + Sync {
    /// Record the current workspace state and return its handle, if tracking is available.
    async fn track(&self) -> Option<String>;

    /// Files changed since `hash`.
    async fn patch(&self, hash: &str) -> Vec<String>;
}

/// Snapshot that never tracks anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnapshot;

#[async_trait]
impl Snapshot for NoSnapshot {
    async fn track(&self) -> Option<String> {
        None
    }

    async fn patch(&self, _hash: &str) -> Vec<String> {
        Vec::new()
    }
}
