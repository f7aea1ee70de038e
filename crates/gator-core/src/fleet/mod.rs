//! Fleet orchestrator (§4.1): runs a batch of issues in dependency order.
//!
//! Issue dependencies are organized into waves via Kahn's algorithm, with
//! issues inside a wave ordered by ascending issue number for determinism.
//! Every issue in wave `k` reaches a terminal status before wave `k+1`
//! starts; within a wave, up to `maxParallelIssues` issues run concurrently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{self, FleetCheckpointState, FleetIssueEntry, IssueStatus};
use crate::harness::HarnessRegistry;
use crate::isolation::Isolation;
use crate::issue::config::RuntimeConfig;
use crate::issue::error::OrchestrationError;
use crate::issue::{self, IssueOrchestratorParams, IssueOutcome};
use crate::platform::PlatformProvider;
use crate::token::TokenConfig;
use crate::worktree::WorktreeManager;

const FLEET_CHECKPOINT_VERSION: u32 = 1;
const FLEET_CHECKPOINT_FILE: &str = "fleet-checkpoint.json";

/// A single issue to run, along with the issue numbers it depends on.
#[derive(Debug, Clone)]
pub struct FleetIssue {
    pub number: u64,
    pub title: String,
    pub depends_on: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub project_name: String,
    pub repo_path: PathBuf,
    pub progress_root: PathBuf,
    pub max_parallel_issues: usize,
}

#[derive(Debug, Clone)]
pub struct FleetResult {
    pub issue_results: HashMap<u64, IssueOutcome>,
    pub token_usage_total: i64,
}

/// Thin trait so the fleet can forward phase/issue events to a caller
/// without the caller holding a back-reference into the fleet (§9).
pub trait NotificationSink: Send + Sync {
    fn notify(&self, issue_number: u64, message: &str);
}

pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn notify(&self, _issue_number: u64, _message: &str) {}
}

/// Arrange issues into waves via Kahn's algorithm. Issues within a wave are
/// sorted by ascending issue number. Returns [`OrchestrationError::CyclicIssueDependency`]
/// naming every issue left over once no more in-degree-zero nodes remain.
pub fn build_waves(issues: &[FleetIssue]) -> Result<Vec<Vec<u64>>, OrchestrationError> {
    let numbers: HashSet<u64> = issues.iter().map(|i| i.number).collect();

    let mut in_degree: HashMap<u64, usize> = HashMap::new();
    let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();

    for issue in issues {
        in_degree.entry(issue.number).or_insert(0);
        for dep in &issue.depends_on {
            if !numbers.contains(dep) {
                continue;
            }
            *in_degree.entry(issue.number).or_insert(0) += 1;
            dependents.entry(*dep).or_default().push(issue.number);
        }
    }

    let mut waves = Vec::new();
    let mut remaining: HashSet<u64> = numbers.clone();
    let mut frontier: VecDeque<u64> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();

    while !frontier.is_empty() {
        let mut wave: Vec<u64> = frontier.drain(..).collect();
        wave.sort_unstable();
        for n in &wave {
            remaining.remove(n);
        }

        let mut next_frontier = Vec::new();
        for &n in &wave {
            if let Some(deps) = dependents.get(&n) {
                for &dependent in deps {
                    if let Some(deg) = in_degree.get_mut(&dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next_frontier.push(dependent);
                        }
                    }
                }
            }
        }

        waves.push(wave);
        frontier.extend(next_frontier);
    }

    if !remaining.is_empty() {
        let mut cyclic: Vec<u64> = remaining.into_iter().collect();
        cyclic.sort_unstable();
        return Err(OrchestrationError::CyclicIssueDependency(cyclic));
    }

    Ok(waves)
}

fn checkpoint_path(progress_root: &std::path::Path) -> PathBuf {
    progress_root.join(FLEET_CHECKPOINT_FILE)
}

fn load_fleet_checkpoint(progress_root: &std::path::Path, project_name: &str) -> Result<FleetCheckpointState> {
    checkpoint::load_or_default(
        &checkpoint_path(progress_root),
        FLEET_CHECKPOINT_VERSION,
        |s| s.version,
        || FleetCheckpointState::new(project_name, Utc::now()),
    )
    .context("failed to load fleet checkpoint")
}

fn save_fleet_checkpoint(progress_root: &std::path::Path, state: &FleetCheckpointState) -> Result<()> {
    checkpoint::save(&checkpoint_path(progress_root), state).context("failed to save fleet checkpoint")
}

fn outcome_to_status(outcome: &IssueOutcome) -> IssueStatus {
    match outcome {
        IssueOutcome::Completed => IssueStatus::Completed,
        IssueOutcome::Failed => IssueStatus::Failed,
        IssueOutcome::BudgetExceeded => IssueStatus::BudgetExceeded,
        IssueOutcome::CodeCompleteNoPr => IssueStatus::CodeCompleteNoPr,
    }
}

fn status_to_outcome(status: IssueStatus) -> Option<IssueOutcome> {
    match status {
        IssueStatus::Completed => Some(IssueOutcome::Completed),
        IssueStatus::Failed | IssueStatus::Blocked => Some(IssueOutcome::Failed),
        IssueStatus::BudgetExceeded => Some(IssueOutcome::BudgetExceeded),
        IssueStatus::CodeCompleteNoPr => Some(IssueOutcome::CodeCompleteNoPr),
        IssueStatus::NotStarted | IssueStatus::InProgress => None,
    }
}

struct IssueRunOutput {
    number: u64,
    outcome: Result<IssueOutcome>,
    token_usage_total: i64,
}

#[allow(clippy::too_many_arguments)]
async fn run_one_issue(
    issue: FleetIssue,
    repo_path: PathBuf,
    progress_root: PathBuf,
    config: RuntimeConfig,
    pool: PgPool,
    harness_registry: Arc<HarnessRegistry>,
    isolation: Arc<dyn Isolation>,
    token_config: TokenConfig,
    platform: Arc<dyn PlatformProvider>,
    sink: Arc<dyn NotificationSink>,
) -> IssueRunOutput {
    sink.notify(issue.number, "starting issue");

    let run_result = async {
        let manager = WorktreeManager::new(repo_path, None).context("failed to open worktree manager")?;
        let branch = config.render_branch_name(issue.number, &issue.title);
        let worktree_info = manager
            .create_worktree(&branch)
            .context("failed to create worktree")?;

        let progress_dir = progress_root.join(format!("issue-{}", issue.number));

        let params = IssueOrchestratorParams {
            issue_number: issue.number,
            issue_title: issue.title.clone(),
            worktree_path: worktree_info.path.clone(),
            progress_dir,
            base_commit: worktree_info.head_commit.clone(),
            config,
            pool: &pool,
            harness_registry,
            isolation,
            token_config,
            platform,
        };

        issue::run(params).await
    }
    .await;

    match &run_result {
        Ok(result) => sink.notify(issue.number, &format!("issue finished: {:?}", result.outcome)),
        Err(e) => sink.notify(issue.number, &format!("issue errored: {e}")),
    }

    let token_usage_total = run_result.as_ref().map(|r| r.token_usage_total).unwrap_or(0);
    IssueRunOutput {
        number: issue.number,
        outcome: run_result.map(|r| r.outcome),
        token_usage_total,
    }
}

/// Run the fleet: build waves from `issues`, then run each wave to a strict
/// terminal-status barrier before starting the next.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    issues: Vec<FleetIssue>,
    options: FleetOptions,
    config: RuntimeConfig,
    pool: PgPool,
    harness_registry: Arc<HarnessRegistry>,
    isolation: Arc<dyn Isolation>,
    token_config: TokenConfig,
    platform: Arc<dyn PlatformProvider>,
    sink: Arc<dyn NotificationSink>,
) -> Result<FleetResult> {
    let waves = build_waves(&issues)?;

    let issues_by_number: HashMap<u64, FleetIssue> =
        issues.into_iter().map(|i| (i.number, i)).collect();

    let mut fleet_checkpoint = load_fleet_checkpoint(&options.progress_root, &options.project_name)?;
    for (&number, issue) in &issues_by_number {
        fleet_checkpoint.issues.entry(number).or_insert(FleetIssueEntry {
            status: IssueStatus::NotStarted,
            issue_title: issue.title.clone(),
            worktree_path: None,
            branch_name: None,
            last_phase: 0,
            pr_number: None,
        });
    }
    save_fleet_checkpoint(&options.progress_root, &fleet_checkpoint)?;

    let mut issue_results: HashMap<u64, IssueOutcome> = HashMap::new();
    let semaphore = Arc::new(Semaphore::new(options.max_parallel_issues.max(1)));

    for wave in waves {
        let mut join_set: JoinSet<IssueRunOutput> = JoinSet::new();

        for number in wave {
            let Some(entry) = fleet_checkpoint.issues.get(&number) else { continue };
            if entry.status.is_terminal() {
                if let Some(outcome) = status_to_outcome(entry.status) {
                    issue_results.insert(number, outcome);
                }
                continue;
            }

            let issue = issues_by_number
                .get(&number)
                .cloned()
                .expect("issue present in waves must exist in issues_by_number");
            let permit = Arc::clone(&semaphore);
            let repo_path = options.repo_path.clone();
            let progress_root = options.progress_root.clone();
            let config = config.clone();
            let pool = pool.clone();
            let harness_registry = Arc::clone(&harness_registry);
            let isolation = Arc::clone(&isolation);
            let token_config = token_config.clone();
            let platform = Arc::clone(&platform);
            let sink = Arc::clone(&sink);

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                run_one_issue(
                    issue,
                    repo_path,
                    progress_root,
                    config,
                    pool,
                    harness_registry,
                    isolation,
                    token_config,
                    platform,
                    sink,
                )
                .await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let output = joined.context("issue task panicked")?;
            let status = match &output.outcome {
                Ok(outcome) => outcome_to_status(outcome),
                Err(_) => IssueStatus::Failed,
            };

            fleet_checkpoint.set_issue_status(output.number, status, Utc::now());
            fleet_checkpoint.record_token_usage(output.number, output.token_usage_total, Utc::now());
            save_fleet_checkpoint(&options.progress_root, &fleet_checkpoint)?;

            if let Ok(outcome) = output.outcome {
                issue_results.insert(output.number, outcome);
            }
        }
    }

    Ok(FleetResult {
        issue_results,
        token_usage_total: fleet_checkpoint.token_usage_total,
    })
}
