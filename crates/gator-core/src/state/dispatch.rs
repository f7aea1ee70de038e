//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::TaskStatus;
use gator_db::queries::tasks as db;

use super::TaskStateMachine;

/// Assign a task to a harness and worktree.
///
/// Validates that all dependencies are `passed`, sets metadata,
/// and transitions `pending -> assigned`.
pub async fn assign_task(
    pool: &PgPool,
    task_id: Uuid,
    harness: &str,
    worktree_path: &Path,
) -> Result<()> {
    TaskStateMachine::assign_task(pool, task_id, harness, worktree_path).await
}

/// Start a task: transition `assigned -> running`.
///
/// Sets `started_at` to the current timestamp.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Assigned, TaskStatus::Running).await
}

/// Begin checking a task's invariants: transition `running -> checking`.
pub async fn begin_checking(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Checking).await
}

/// Mark a task as passed: transition `checking -> passed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn pass_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Mark a task as failed: transition `checking -> failed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Retry a failed task: transition `failed -> assigned`.
///
/// Increments the attempt counter. Fails if `attempt >= retry_max`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Assigned).await
}

/// Escalate a failed task: transition `failed -> escalated`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn escalate_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Escalated).await
}

/// Operator approves an escalated task: transition `escalated -> passed`.
pub async fn approve_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Escalated, TaskStatus::Passed).await
}

/// Operator rejects an escalated task: transition `escalated -> failed`.
pub async fn reject_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Escalated, TaskStatus::Failed).await
}

/// Operator-initiated reset of a stuck task back to `pending`.
///
/// Without `force`, only `escalated` and `failed` tasks can be reset (via
/// [`db::retry_escalated_to_pending`] / [`db::retry_task_to_pending`], both
/// of which increment the attempt counter under optimistic locking). With
/// `force`, any status is overwritten directly to `pending`, bypassing the
/// attempt lock — for a task stuck in `running`/`checking` with a dead
/// harness process.
pub async fn operator_retry_task(pool: &PgPool, task_id: Uuid, force: bool) -> Result<()> {
    let task = db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Escalated => {
            let rows = db::retry_escalated_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!("optimistic lock failed resetting escalated task {}", task_id);
            }
            Ok(())
        }
        TaskStatus::Failed => {
            let rows = db::retry_task_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!("optimistic lock failed resetting failed task {}", task_id);
            }
            Ok(())
        }
        other if force => db::update_task_status(pool, task_id, TaskStatus::Pending)
            .await
            .with_context(|| format!("failed to force-reset task {} from {}", task_id, other)),
        other => bail!(
            "cannot retry task {} in status {}: not failed or escalated (use --force to override)",
            task_id,
            other
        ),
    }
}
