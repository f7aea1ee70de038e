//! `gator pr <plan-id>` command: summarize a completed plan's task branches
//! as a pull request description.
//!
//! No concrete GitHub/GitLab client ships with this CLI (the platform
//! provider contract lives in `gator_core::platform` for callers that want
//! to wire one in); this command prints the title/body/branch list an
//! operator would hand to `gh pr create` or paste into their platform's UI.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use gator_core::worktree::WorktreeManager;
use gator_db::models::{PlanStatus, TaskStatus};
use gator_db::queries::plans as plan_db;
use gator_db::queries::tasks as task_db;

#[derive(Debug, Clone)]
pub struct PrOptions {
    pub draft: bool,
    pub base: Option<String>,
}

pub async fn run_pr(pool: &PgPool, plan_id_str: &str, options: &PrOptions) -> Result<()> {
    let plan_id =
        Uuid::parse_str(plan_id_str).with_context(|| format!("invalid plan ID: {plan_id_str}"))?;

    let plan = plan_db::get_plan(pool, plan_id)
        .await?
        .with_context(|| format!("plan {plan_id} not found"))?;

    if plan.status != PlanStatus::Completed {
        bail!(
            "plan {} is {} -- all tasks must pass before composing a PR (expected completed)",
            plan_id,
            plan.status
        );
    }

    let base = options.base.clone().unwrap_or_else(|| plan.base_branch.clone());
    let tasks = task_db::list_tasks_for_plan(pool, plan_id).await?;
    let passed: Vec<_> = tasks.iter().filter(|t| t.status == TaskStatus::Passed).collect();

    if passed.is_empty() {
        bail!("plan {} has no passed tasks to include in a PR", plan_id);
    }

    let branches: Vec<String> = passed
        .iter()
        .map(|t| WorktreeManager::branch_name(&plan.name, &t.name))
        .collect();

    println!("Title: {}", plan.name);
    println!("Base: {base}");
    println!("Draft: {}", options.draft);
    println!("\nBody:");
    println!("Completed tasks for plan {}:\n", plan.name);
    for task in &passed {
        println!("- {} ({})", task.name, task.description);
    }
    println!("\nBranches:");
    for branch in &branches {
        println!("- {branch}");
    }

    Ok(())
}
