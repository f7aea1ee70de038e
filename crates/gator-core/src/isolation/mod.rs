//! Workspace isolation abstraction.
//!
//! Decouples workspace creation from `WorktreeManager` so that different
//! backends (git worktrees, Docker containers) can be used interchangeably.

pub mod container;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Information about a created workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    /// Path to the workspace as seen by the agent (worktree dir, or the
    /// in-container mount point such as `/workspace`).
    pub path: PathBuf,
    /// Path to the backing host worktree, if this backend has one.
    /// `ContainerIsolation` needs this to copy results back out.
    pub host_path: Option<PathBuf>,
    /// Git branch name, if applicable.
    pub branch: Option<String>,
    /// Docker container ID, if applicable.
    pub container_id: Option<String>,
}

/// Trait for workspace isolation backends.
#[async_trait]
pub trait Isolation: Send + Sync {
    /// Human-readable name of the isolation backend (e.g. "worktree", "container").
    fn name(&self) -> &str;

    /// Create an isolated workspace for a task.
    async fn create_workspace(&self, plan_name: &str, task_name: &str) -> Result<WorkspaceInfo>;

    /// Pull agent-produced changes back into the host worktree.
    ///
    /// For `WorktreeIsolation` this is a no-op (the agent already wrote
    /// directly into the worktree). For `ContainerIsolation` this copies
    /// `/workspace` back to the host worktree via `docker cp`.
    async fn extract_results(&self, info: &WorkspaceInfo) -> Result<()>;

    /// Remove a previously created workspace.
    async fn remove_workspace(&self, info: &WorkspaceInfo) -> Result<()>;
}

/// Factory function: create an isolation backend from a mode string.
pub fn create_isolation(mode: &str, repo_path: &Path) -> Result<Arc<dyn Isolation>> {
    let mgr = crate::worktree::WorktreeManager::new(repo_path, None)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    match mode {
        "worktree" => Ok(Arc::new(worktree::WorktreeIsolation::new(mgr))),
        "container" => {
            let config = container::ContainerConfig {
                image: "ubuntu:24.04".to_string(),
                extra_flags: vec![],
            };
            Ok(Arc::new(container::ContainerIsolation::new(config, mgr)))
        }
        other => {
            bail!("unknown isolation mode: {other:?} (expected \"worktree\" or \"container\")")
        }
    }
}
