//! TOML format types for plan definition files.
//!
//! These types map directly to the `plan.toml` on-disk format and are
//! deserialized via `serde` + the `toml` crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level structure of a `plan.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanToml {
    /// Plan metadata.
    pub plan: PlanMeta,
    /// Tasks within the plan.
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// Plan-level metadata in `[plan]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    /// Plan UUID, set after `gator plan create` writes the plan to the database.
    /// Absent in authored plan files, present once the plan has been created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Human-readable plan name.
    pub name: String,
    /// Git branch to use as the base for task branches.
    pub base_branch: String,
    /// Optional total token budget (input + output). NULL means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,
    /// Default harness to use for tasks that don't specify one.
    #[serde(default = "default_harness_name")]
    pub default_harness: String,
    /// Isolation mode: "worktree" or "container".
    #[serde(default = "default_isolation")]
    pub isolation: String,
    /// Docker image to use for container isolation (e.g. "gator-agent:latest").
    /// Only used when `isolation = "container"`. Falls back to "ubuntu:24.04".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
}

/// A single `[[tasks]]` entry in the plan TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Unique task name within the plan (used as an identifier in `depends_on`).
    pub name: String,
    /// Multi-line description of what the task should accomplish.
    pub description: String,
    /// Scope level: "narrow", "medium", or "broad".
    pub scope: String,
    /// Gate policy: "auto", "human_review", or "human_approve".
    pub gate: String,
    /// Maximum retry attempts before escalation.
    #[serde(default = "default_retry_max")]
    pub retry_max: i32,
    /// Names of tasks this task depends on (must complete first).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Names of invariants to link to this task.
    #[serde(default)]
    pub invariants: Vec<String>,
    /// Override harness for this task (uses plan default_harness if not set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harness: Option<String>,
}

fn default_retry_max() -> i32 {
    3
}

fn default_harness_name() -> String {
    "claude-code".to_string()
}

fn default_isolation() -> String {
    "worktree".to_string()
}
