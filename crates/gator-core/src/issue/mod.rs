//! The per-issue five-phase pipeline (§4.2): runs phases 1-5 in order,
//! skipping completed phases, gating between them, and checkpointing after
//! every mutation.

pub mod config;
pub mod error;
pub mod gates;
pub mod phases;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::budget::{BudgetGuard, TokenTracker};
use crate::checkpoint::{self, CheckpointState};
use crate::harness::HarnessRegistry;
use crate::isolation::Isolation;
use crate::issue::config::RuntimeConfig;
use crate::issue::error::OrchestrationError;
use crate::issue::gates::{GateContext, GateResult, GateStatus};
use crate::issue::phases::{phase_registry, PhaseContext, PhaseExecutor};
use crate::launcher::ProcessRegistry;
use crate::platform::PlatformProvider;
use crate::token::TokenConfig;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Completed,
    Failed,
    BudgetExceeded,
    CodeCompleteNoPr,
}

#[derive(Debug, Clone)]
pub struct IssueResult {
    pub issue_number: u64,
    pub outcome: IssueOutcome,
    pub token_usage_total: i64,
    pub final_phase: u32,
}

pub struct IssueOrchestratorParams<'a> {
    pub issue_number: u64,
    pub issue_title: String,
    pub worktree_path: PathBuf,
    pub progress_dir: PathBuf,
    pub base_commit: String,
    pub config: RuntimeConfig,
    pub pool: &'a PgPool,
    pub harness_registry: Arc<HarnessRegistry>,
    pub isolation: Arc<dyn Isolation>,
    pub token_config: TokenConfig,
    pub platform: Arc<dyn PlatformProvider>,
}

fn checkpoint_path(progress_dir: &Path) -> PathBuf {
    progress_dir.join(CHECKPOINT_FILE)
}

fn load_checkpoint(progress_dir: &Path, issue_number: u64) -> Result<CheckpointState> {
    let path = checkpoint_path(progress_dir);
    checkpoint::load_or_default(&path, CHECKPOINT_VERSION, |s| s.version, || {
        CheckpointState::new(issue_number, Utc::now())
    })
    .context("failed to load issue checkpoint")
}

fn save_checkpoint(progress_dir: &Path, state: &CheckpointState) -> Result<()> {
    checkpoint::save(&checkpoint_path(progress_dir), state).context("failed to save issue checkpoint")
}

/// Commit the worktree with the phase's configured template, substituting
/// `{issueNumber}`. Returns `Ok(())` even if there was nothing to commit.
fn commit_phase(worktree_path: &Path, message: &str) -> Result<()> {
    let _ = std::process::Command::new("git")
        .args(["add", "-A"])
        .current_dir(worktree_path)
        .output();

    let output = std::process::Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(worktree_path)
        .output()
        .context("failed to run git commit")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("nothing to commit") {
            tracing::warn!(stderr = %stderr, "phase commit reported an error");
        }
    }

    Ok(())
}

/// Run the five-phase pipeline for one issue, resuming from its checkpoint.
pub async fn run(params: IssueOrchestratorParams<'_>) -> Result<IssueResult> {
    let IssueOrchestratorParams {
        issue_number,
        issue_title,
        worktree_path,
        progress_dir,
        base_commit,
        config,
        pool,
        harness_registry,
        isolation,
        token_config,
        platform,
    } = params;

    std::fs::create_dir_all(&progress_dir)
        .with_context(|| format!("failed to create progress dir {}", progress_dir.display()))?;

    let mut checkpoint = load_checkpoint(&progress_dir, issue_number)?;
    checkpoint.resume_count += 1;
    if checkpoint.worktree_path.is_none() {
        checkpoint.set_worktree_info(
            worktree_path.clone(),
            String::new(),
            base_commit.to_string(),
            Utc::now(),
        );
    }
    save_checkpoint(&progress_dir, &checkpoint)?;

    let process_registry = ProcessRegistry::new();
    let registry = phase_registry();
    let mut final_phase = checkpoint.current_phase;

    let token_tracker = Arc::new(TokenTracker::new());
    let budget_guard = BudgetGuard::new(Arc::clone(&token_tracker), issue_number, config.token_budget);

    for executor in &registry {
        let phase_id = executor.phase_id();
        final_phase = phase_id;

        if checkpoint.is_phase_completed(phase_id) {
            tracing::info!(issue = issue_number, phase = phase_id, "phase already complete, skipping");
            continue;
        }

        if config.dry_run && phase_id > 2 {
            tracing::info!(issue = issue_number, "dry run: stopping after phase 2");
            break;
        }

        checkpoint.start_phase(phase_id, Utc::now());
        save_checkpoint(&progress_dir, &checkpoint)?;

        tracing::info!(issue = issue_number, phase = phase_id, name = executor.name(), "starting phase");

        let ctx = PhaseContext {
            issue_number,
            issue_title: &issue_title,
            worktree_path: &worktree_path,
            progress_dir: &progress_dir,
            base_commit: &base_commit,
            config: &config,
            process_registry: &process_registry,
            pool,
            harness_registry: &harness_registry,
            isolation: &isolation,
            token_config: &token_config,
            platform: platform.as_ref(),
            budget_guard: &budget_guard,
        };

        let outcome = match executor.execute(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.downcast_ref::<crate::budget::BudgetExceededError>().is_some() {
                    checkpoint.budget_exceeded = true;
                    save_checkpoint(&progress_dir, &checkpoint)?;
                    tracing::warn!(issue = issue_number, phase = phase_id, "budget exceeded; resume later");
                    return Ok(IssueResult {
                        issue_number,
                        outcome: IssueOutcome::BudgetExceeded,
                        token_usage_total: checkpoint.token_usage.total,
                        final_phase: phase_id,
                    });
                }

                if phase_id <= 3 {
                    tracing::error!(issue = issue_number, phase = phase_id, error = %e, "critical phase failed");
                    return Ok(IssueResult {
                        issue_number,
                        outcome: IssueOutcome::Failed,
                        token_usage_total: checkpoint.token_usage.total,
                        final_phase: phase_id,
                    });
                }

                tracing::warn!(issue = issue_number, phase = phase_id, error = %e, "non-critical phase failed");
                checkpoint.complete_phase(phase_id, progress_dir.join(format!("phase-{phase_id}-failed")), Utc::now());
                save_checkpoint(&progress_dir, &checkpoint)?;

                if phase_id == 5 {
                    return Ok(IssueResult {
                        issue_number,
                        outcome: IssueOutcome::CodeCompleteNoPr,
                        token_usage_total: checkpoint.token_usage.total,
                        final_phase: phase_id,
                    });
                }
                continue;
            }
        };

        for (agent, tokens) in &outcome.token_usage {
            checkpoint.record_token_usage(phase_id, agent, *tokens, Utc::now());
        }

        checkpoint.complete_phase(phase_id, outcome.output_path.clone(), Utc::now());
        save_checkpoint(&progress_dir, &checkpoint)?;

        if (1..=4).contains(&phase_id) {
            let gate_result = run_gate_with_retry(
                executor,
                phase_id,
                &progress_dir,
                &worktree_path,
                &base_commit,
                &config,
                &outcome,
                pool,
                &harness_registry,
                &isolation,
                &token_config,
                platform.as_ref(),
                issue_number,
                &issue_title,
                &process_registry,
                &budget_guard,
            )
            .await;

            match gate_result {
                Ok((result, retry_token_usage)) => {
                    for (agent, tokens) in &retry_token_usage {
                        checkpoint.record_token_usage(phase_id, agent, *tokens, Utc::now());
                    }
                    let gate_status = to_checkpoint_gate_status(result.status());
                    checkpoint.record_gate_result(
                        phase_id,
                        crate::checkpoint::GateResult {
                            status: gate_status,
                            errors_count: result.errors.len() as u32,
                            warnings_count: result.warnings.len() as u32,
                        },
                        Utc::now(),
                    );
                    save_checkpoint(&progress_dir, &checkpoint)?;
                }
                Err(OrchestrationError::GateValidation { .. }) => {
                    tracing::error!(issue = issue_number, phase = phase_id, "gate failed after retry");
                    return Ok(IssueResult {
                        issue_number,
                        outcome: IssueOutcome::Failed,
                        token_usage_total: checkpoint.token_usage.total,
                        final_phase: phase_id,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        if phase_id == 1 {
            if let Some(count) = outcome.ambiguity_count {
                let gate = gates::ambiguity_gate(count, config.ambiguity_threshold);
                if config.halt_on_ambiguity && gate.status() != GateStatus::Pass {
                    tracing::warn!(issue = issue_number, ambiguity_count = count, "halting on ambiguity");
                    return Ok(IssueResult {
                        issue_number,
                        outcome: IssueOutcome::Failed,
                        token_usage_total: checkpoint.token_usage.total,
                        final_phase: phase_id,
                    });
                }
            }
        }

        if config.commit_per_phase {
            if let Some(message) = config.render_commit_message(phase_id, issue_number) {
                commit_phase(&worktree_path, &message)?;
            }
        }

        tracing::info!(issue = issue_number, phase = phase_id, "phase completed");
    }

    Ok(IssueResult {
        issue_number,
        outcome: IssueOutcome::Completed,
        token_usage_total: checkpoint.token_usage.total,
        final_phase,
    })
}

fn to_checkpoint_gate_status(status: GateStatus) -> crate::checkpoint::GateStatus {
    match status {
        GateStatus::Pass => crate::checkpoint::GateStatus::Pass,
        GateStatus::Warn => crate::checkpoint::GateStatus::Warn,
        GateStatus::Fail => crate::checkpoint::GateStatus::Fail,
    }
}

fn evaluate_gate(
    phase_id: u32,
    progress_dir: &Path,
    worktree_path: &Path,
    base_commit: &str,
    outcome: &phases::PhaseOutcome,
) -> Result<GateResult> {
    let ctx = GateContext {
        progress_dir,
        worktree_path,
        base_commit,
    };

    Ok(match phase_id {
        1 => gates::analysis_gate(&ctx),
        2 => {
            let tasks = phases::read_tasks_from_plan(&outcome.output_path)?;
            gates::plan_gate(&tasks)
        }
        3 => gates::implementation_gate(&ctx),
        4 => gates::integration_gate(outcome.build_exit, outcome.test_exit),
        _ => GateResult::pass(),
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_gate_with_retry<'a>(
    executor: &Box<dyn phases::PhaseExecutor>,
    phase_id: u32,
    progress_dir: &Path,
    worktree_path: &Path,
    base_commit: &str,
    config: &RuntimeConfig,
    outcome: &phases::PhaseOutcome,
    pool: &'a PgPool,
    harness_registry: &Arc<HarnessRegistry>,
    isolation: &Arc<dyn Isolation>,
    token_config: &TokenConfig,
    platform: &dyn PlatformProvider,
    issue_number: u64,
    issue_title: &str,
    process_registry: &ProcessRegistry,
    budget_guard: &BudgetGuard,
) -> Result<(GateResult, Vec<(String, i64)>), OrchestrationError> {
    let result = evaluate_gate(phase_id, progress_dir, worktree_path, base_commit, outcome)
        .map_err(|e| OrchestrationError::AgentFailure {
            agent: executor.name().to_string(),
            reason: e.to_string(),
        })?;

    if result.status() != GateStatus::Fail {
        return Ok((result, Vec::new()));
    }

    tracing::warn!(issue = issue_number, phase = phase_id, "gate failed, retrying phase once");

    let ctx = PhaseContext {
        issue_number,
        issue_title,
        worktree_path,
        progress_dir,
        base_commit,
        config,
        process_registry,
        pool,
        harness_registry,
        isolation,
        token_config,
        platform,
        budget_guard,
    };

    let retry_outcome = executor
        .execute(&ctx)
        .await
        .map_err(|e| OrchestrationError::AgentFailure {
            agent: executor.name().to_string(),
            reason: e.to_string(),
        })?;

    let retry_result = evaluate_gate(phase_id, progress_dir, worktree_path, base_commit, &retry_outcome)
        .map_err(|e| OrchestrationError::AgentFailure {
            agent: executor.name().to_string(),
            reason: e.to_string(),
        })?;

    if retry_result.status() == GateStatus::Fail {
        return Err(OrchestrationError::GateValidation {
            phase: phase_id,
            result: retry_result,
        });
    }

    Ok((retry_result, retry_outcome.token_usage))
}
