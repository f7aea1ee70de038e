//! The five phase executors (§4.2.1-§4.2.5), each producing an output path
//! under the issue's progress directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::budget::BudgetGuard;
use crate::cadre_json;
use crate::harness::HarnessRegistry;
use crate::isolation::Isolation;
use crate::issue::config::{CommandSpec, RuntimeConfig};
use crate::launcher::{self, AgentInvocation, ProcessRegistry};
use crate::plan::{topological_sort, ImplementationTask};
use crate::platform::PlatformProvider;
use crate::retry::{self, RetryableError};
use crate::token::TokenConfig;

const MAX_DIFF_CHARS: usize = 200_000;

/// Shared context for a single phase's execution.
pub struct PhaseContext<'a> {
    pub issue_number: u64,
    pub issue_title: &'a str,
    pub worktree_path: &'a Path,
    pub progress_dir: &'a Path,
    pub base_commit: &'a str,
    pub config: &'a RuntimeConfig,
    pub process_registry: &'a ProcessRegistry,
    pub pool: &'a PgPool,
    pub harness_registry: &'a Arc<HarnessRegistry>,
    pub isolation: &'a Arc<dyn Isolation>,
    pub token_config: &'a TokenConfig,
    pub platform: &'a dyn PlatformProvider,
    pub budget_guard: &'a BudgetGuard,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub output_path: PathBuf,
    pub ambiguity_count: Option<usize>,
    pub build_exit: Option<i32>,
    pub test_exit: Option<i32>,
    /// `(agent, tokens)` entries for every agent launch this phase made, so
    /// the caller can fold them into the issue checkpoint's token ledger.
    pub token_usage: Vec<(String, i64)>,
}

/// A pluggable phase in the fixed five-phase pipeline (§9 design note).
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn phase_id(&self) -> u32;
    fn name(&self) -> &str;
    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome>;
}

/// Build the fixed, ordered registry of phase executors.
pub fn phase_registry() -> Vec<Box<dyn PhaseExecutor>> {
    vec![
        Box::new(AnalysisAndScoutingPhase),
        Box::new(PlanningPhase),
        Box::new(ImplementationPhase),
        Box::new(IntegrationVerificationPhase),
        Box::new(PrCompositionPhase),
    ]
}

struct OneShotAgentResult {
    stdout: String,
    token_usage: i64,
}

/// Launch `agent` once, recording its token usage against the issue's budget
/// guard and retrying transient failures with backoff. A budget breach
/// reported by the guard (before launch, after launch, or via the retry
/// executor's own bookkeeping) aborts the retry loop immediately rather than
/// spending further attempts.
async fn run_one_shot_agent(
    ctx: &PhaseContext<'_>,
    agent: &str,
    phase: u32,
    prompt: &str,
    output_path: &Path,
) -> Result<OneShotAgentResult> {
    let max_attempts = ctx.config.max_retries_per_task + 1;

    let outcome = retry::execute(agent, max_attempts, |attempt| {
        run_one_shot_attempt(ctx, agent, phase, prompt, output_path, attempt)
    })
    .await;

    match outcome.result {
        Some(result) => Ok(result),
        None => anyhow::bail!(
            "agent {agent} failed after {} attempt(s): {}",
            outcome.attempts,
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn run_one_shot_attempt(
    ctx: &PhaseContext<'_>,
    agent: &str,
    phase: u32,
    prompt: &str,
    output_path: &Path,
    attempt: u32,
) -> Result<OneShotAgentResult, RetryableError> {
    ctx.budget_guard.check_budget()?;

    let (command, args) = launcher::resolve_backend_command(&ctx.config.backend, prompt)
        .with_context(|| format!("failed to resolve agent backend command for {agent}"))?;

    let invocation = AgentInvocation {
        agent: agent.to_string(),
        issue_number: ctx.issue_number,
        phase,
        session_id: None,
        context_path: ctx.progress_dir.join("context.md"),
        output_path: output_path.to_path_buf(),
        timeout: None,
        command,
        args,
        extra_path: ctx.config.extra_path.clone(),
    };

    let result = launcher::launch_agent(&invocation, ctx.worktree_path, ctx.process_registry)
        .await
        .with_context(|| format!("failed to launch agent {agent} (attempt {attempt})"))?;

    if ctx.budget_guard.record(agent, phase, result.token_usage) {
        tracing::warn!(issue = ctx.issue_number, agent, phase, "budget-warning");
    }

    if !result.success {
        return Err(RetryableError::Other(anyhow::anyhow!(
            "agent {agent} failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        )));
    }

    ctx.budget_guard.check_budget()?;

    Ok(OneShotAgentResult {
        stdout: result.stdout,
        token_usage: result.token_usage,
    })
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

fn run_command_spec(worktree: &Path, spec: &CommandSpec) -> (Option<i32>, String, String) {
    let output = std::process::Command::new(&spec.command)
        .args(&spec.args)
        .current_dir(worktree)
        .output();

    match output {
        Ok(output) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ),
        Err(e) => (None, String::new(), e.to_string()),
    }
}

/// Run `git <args>` in `worktree`, arguments passed straight through to
/// `exec` (no shell), so issue titles, branch names, and commit messages
/// never get shell-interpreted.
fn run_git(worktree: &Path, args: &[&str]) -> (Option<i32>, String, String) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(worktree)
        .output();

    match output {
        Ok(output) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ),
        Err(e) => (None, String::new(), e.to_string()),
    }
}

/// Best-effort `git add -A && git commit -m <message>`; a "nothing to
/// commit" failure is not logged, any other failure is a warning.
fn commit_worktree(worktree_path: &Path, message: &str) {
    let _ = std::process::Command::new("git")
        .args(["add", "-A"])
        .current_dir(worktree_path)
        .output();

    let output = std::process::Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(worktree_path)
        .output();

    if let Ok(output) = output {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("nothing to commit") {
                tracing::warn!(stderr = %stderr, "commit reported an error");
            }
        }
    }
}

fn extract_failure_lines(text: &str) -> Vec<String> {
    let markers = ["FAIL ", "error: ", "\u{2717}", "\u{00d7}"];
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in text.lines() {
        if markers.iter().any(|m| line.contains(m)) && seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    out
}

fn enumerate_worktree_files(worktree: &Path) -> Vec<String> {
    let mut files = Vec::new();
    walk(worktree, worktree, &mut files);
    files.sort();
    files
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(".cadre")
            || path.file_name().and_then(|n| n.to_str()) == Some(".git")
        {
            continue;
        }
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().to_string());
        }
    }
}

fn get_task_diff(worktree: &Path, base_commit: &str) -> String {
    let range = format!("{base_commit}..HEAD");
    let (_code, diff, _stderr) = run_git(worktree, &["diff", range.as_str()]);
    diff
}

/// Truncate a diff to [`MAX_DIFF_CHARS`] characters, appending a truncation
/// notice sentinel. A diff of exactly the limit is left untouched.
fn truncate_diff(diff: &str) -> String {
    if diff.chars().count() <= MAX_DIFF_CHARS {
        return diff.to_string();
    }
    let truncated: String = diff.chars().take(MAX_DIFF_CHARS).collect();
    format!("{truncated}\n\n[... diff truncated at {MAX_DIFF_CHARS} characters ...]")
}

// ---------------------------------------------------------------------
// Phase 1: Analysis & Scouting
// ---------------------------------------------------------------------

pub struct AnalysisAndScoutingPhase;

#[async_trait]
impl PhaseExecutor for AnalysisAndScoutingPhase {
    fn phase_id(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "analysis-and-scouting"
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        let issue = ctx.platform.get_issue(ctx.issue_number).await;
        let issue_json = match &issue {
            Ok(issue) => serde_json::to_string_pretty(issue)?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch issue; writing stub issue.json");
                serde_json::json!({"number": ctx.issue_number, "title": ctx.issue_title}).to_string()
            }
        };
        write_file(&ctx.progress_dir.join("issue.json"), &issue_json)?;

        let tree = enumerate_worktree_files(ctx.worktree_path).join("\n");
        write_file(&ctx.progress_dir.join("repo-file-tree.txt"), &tree)?;

        let mut token_usage = Vec::new();

        let analysis_prompt = format!(
            "You are issue-analyst. Analyze issue #{} ({}).",
            ctx.issue_number, ctx.issue_title
        );
        let analysis_path = ctx.progress_dir.join("analysis.md");
        let analysis_result = run_one_shot_agent(ctx, "issue-analyst", 1, &analysis_prompt, &analysis_path).await?;
        write_file(&analysis_path, &analysis_result.stdout)?;
        token_usage.push(("issue-analyst".to_string(), analysis_result.token_usage));

        let scout_prompt = "You are codebase-scout. Survey the worktree for files relevant to the analysis.";
        let scout_path = ctx.progress_dir.join("scout-report.md");
        let scout_result = run_one_shot_agent(ctx, "codebase-scout", 1, scout_prompt, &scout_path).await?;
        write_file(&scout_path, &scout_result.stdout)?;
        token_usage.push(("codebase-scout".to_string(), scout_result.token_usage));

        let mut build_exit = None;
        let mut test_exit = None;
        let mut build_failures = Vec::new();
        let mut test_failures = Vec::new();

        if let Some(build) = &ctx.config.commands.build {
            let (code, stdout, stderr) = run_command_spec(ctx.worktree_path, build);
            build_exit = code;
            build_failures = extract_failure_lines(&format!("{stdout}\n{stderr}"));
        }
        if let Some(test) = &ctx.config.commands.test {
            let (code, stdout, stderr) = run_command_spec(ctx.worktree_path, test);
            test_exit = code;
            test_failures = extract_failure_lines(&format!("{stdout}\n{stderr}"));
        }

        let baseline = serde_json::json!({
            "buildExitCode": build_exit.unwrap_or(0),
            "testExitCode": test_exit.unwrap_or(0),
            "buildFailures": build_failures,
            "testFailures": test_failures,
        });
        write_file(
            &ctx.worktree_path.join(".cadre").join("baseline-results.json"),
            &serde_json::to_string_pretty(&baseline)?,
        )?;

        let ambiguity_count = extract_ambiguity_count(&analysis_result.stdout);

        Ok(PhaseOutcome {
            output_path: analysis_path,
            ambiguity_count: Some(ambiguity_count),
            build_exit,
            test_exit,
            token_usage,
        })
    }
}

#[derive(serde::Deserialize)]
struct AmbiguitySidecar {
    #[serde(default)]
    ambiguities: Vec<String>,
}

fn extract_ambiguity_count(analysis: &str) -> usize {
    cadre_json::extract::<AmbiguitySidecar>(analysis)
        .map(|sidecar| sidecar.ambiguities.len())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------
// Phase 2: Planning
// ---------------------------------------------------------------------

pub struct PlanningPhase;

#[async_trait]
impl PhaseExecutor for PlanningPhase {
    fn phase_id(&self) -> u32 {
        2
    }

    fn name(&self) -> &str {
        "planning"
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        let prompt = "You are implementation-planner. Produce an ImplementationTask[] cadre-json block.";
        let output_path = ctx.progress_dir.join("implementation-plan.md");
        let plan_result = run_one_shot_agent(ctx, "implementation-planner", 2, prompt, &output_path).await?;
        write_file(&output_path, &plan_result.stdout)?;

        let tasks = read_tasks_from_plan(&output_path)?;
        if tasks.is_empty() {
            anyhow::bail!("implementation plan has no tasks");
        }
        topological_sort(&tasks).context("implementation plan has a task dependency cycle")?;

        Ok(PhaseOutcome {
            output_path,
            token_usage: vec![("implementation-planner".to_string(), plan_result.token_usage)],
            ..Default::default()
        })
    }
}

/// Read and parse the `cadre-json` block embedded in `implementation-plan.md`.
pub fn read_tasks_from_plan(path: &Path) -> Result<Vec<ImplementationTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    cadre_json::extract(&content).context("failed to parse cadre-json task list")
}

// ---------------------------------------------------------------------
// Phase 3: Implementation
// ---------------------------------------------------------------------

pub struct ImplementationPhase;

#[async_trait]
impl PhaseExecutor for ImplementationPhase {
    fn phase_id(&self) -> u32 {
        3
    }

    fn name(&self) -> &str {
        "implementation"
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        let plan_path = ctx.progress_dir.join("implementation-plan.md");
        let tasks = read_tasks_from_plan(&plan_path)?;

        materialize_tasks_to_db(ctx.pool, ctx.issue_number, ctx.worktree_path, ctx.base_commit, &tasks, ctx.config)
            .await
            .context("failed to materialize implementation tasks")?;

        let mut scheduler = TaskScheduler::new(&tasks);
        let mut token_usage = Vec::new();

        while !scheduler.is_complete() {
            let batch = scheduler.next_batch(ctx.config.max_parallel_agents);
            if batch.is_empty() {
                anyhow::bail!(
                    "implementation task scheduler deadlocked: {:?} still pending with unmet dependencies",
                    scheduler.pending_ids()
                );
            }

            let outcomes =
                futures::future::join_all(batch.iter().map(|task| run_task_session(ctx, task))).await;

            for (task, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(session) => {
                        token_usage.extend(session.token_usage);
                        match session.verdict {
                            TaskVerdict::Pass => scheduler.mark_completed(&task.id),
                            TaskVerdict::NeedsFixes => {
                                tracing::warn!(
                                    issue = ctx.issue_number,
                                    task = %task.id,
                                    "task exhausted review attempts, marking blocked"
                                );
                                scheduler.mark_blocked(&task.id);
                            }
                        }
                    }
                    Err(e) => {
                        if e.downcast_ref::<crate::budget::BudgetExceededError>().is_some() {
                            return Err(e);
                        }
                        tracing::error!(issue = ctx.issue_number, task = %task.id, error = %e, "task session failed");
                        scheduler.mark_blocked(&task.id);
                    }
                }
            }
        }

        let blocked = scheduler.blocked_ids();
        if !blocked.is_empty() {
            anyhow::bail!("tasks blocked after retry exhaustion: {:?}", blocked);
        }

        let review_tokens = run_whole_pr_review(ctx).await?;
        token_usage.extend(review_tokens);

        Ok(PhaseOutcome {
            output_path: plan_path,
            token_usage,
            ..Default::default()
        })
    }
}

async fn materialize_tasks_to_db(
    pool: &PgPool,
    issue_number: u64,
    worktree_path: &Path,
    base_commit: &str,
    tasks: &[ImplementationTask],
    config: &RuntimeConfig,
) -> Result<uuid::Uuid> {
    use gator_db::queries::{plans as plan_db, tasks as task_db};

    let plan = plan_db::insert_plan(
        pool,
        &format!("issue-{issue_number}"),
        &worktree_path.to_string_lossy(),
        base_commit,
    )
    .await?;
    plan_db::approve_plan(pool, plan.id).await?;

    let mut id_map = std::collections::HashMap::new();
    for task in tasks {
        let row = task_db::insert_task(
            pool,
            plan.id,
            &task.name,
            &task.description,
            "auto",
            "auto",
            config.max_retries_per_task as i32,
            Some(&config.backend),
        )
        .await?;
        task_db::set_task_files(pool, row.id, &task.files).await?;
        id_map.insert(task.id.clone(), row.id);
    }

    for task in tasks {
        let Some(&task_uuid) = id_map.get(&task.id) else { continue };
        for dep in &task.dependencies {
            if let Some(&dep_uuid) = id_map.get(dep) {
                task_db::insert_task_dependency(pool, task_uuid, dep_uuid).await?;
            }
        }
    }

    Ok(plan.id)
}

/// Readiness tracker over the task dependency DAG emitted by the planning
/// phase. A task is ready once pending and every dependency is either
/// completed or blocked — a blocked dependency still satisfies the edge so
/// one bad task cannot deadlock the rest of the graph.
struct TaskScheduler {
    tasks: Vec<ImplementationTask>,
    state: HashMap<String, TaskState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskScheduler {
    fn new(tasks: &[ImplementationTask]) -> Self {
        let state = tasks.iter().map(|t| (t.id.clone(), TaskState::Pending)).collect();
        Self {
            tasks: tasks.to_vec(),
            state,
        }
    }

    fn is_satisfied(&self, dep: &str) -> bool {
        matches!(self.state.get(dep), Some(TaskState::Completed) | Some(TaskState::Blocked))
    }

    fn is_ready(&self, task: &ImplementationTask) -> bool {
        self.state.get(&task.id) == Some(&TaskState::Pending)
            && task.dependencies.iter().all(|d| self.is_satisfied(d))
    }

    /// Select up to `max` ready tasks whose `files` are pairwise disjoint, so
    /// the batch can run concurrently without two agents touching the same
    /// file.
    fn next_batch(&mut self, max: usize) -> Vec<ImplementationTask> {
        let mut claimed: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        for task in &self.tasks {
            if batch.len() >= max {
                break;
            }
            if !self.is_ready(task) {
                continue;
            }
            if task.files.iter().any(|f| claimed.contains(f)) {
                continue;
            }
            claimed.extend(task.files.iter().cloned());
            batch.push(task.clone());
        }

        for task in &batch {
            self.state.insert(task.id.clone(), TaskState::InProgress);
        }
        batch
    }

    fn mark_completed(&mut self, task_id: &str) {
        self.state.insert(task_id.to_string(), TaskState::Completed);
    }

    fn mark_blocked(&mut self, task_id: &str) {
        self.state.insert(task_id.to_string(), TaskState::Blocked);
    }

    fn is_complete(&self) -> bool {
        self.state.values().all(|s| matches!(s, TaskState::Completed | TaskState::Blocked))
    }

    fn pending_ids(&self) -> Vec<String> {
        self.state
            .iter()
            .filter(|(_, s)| matches!(s, TaskState::Pending | TaskState::InProgress))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn blocked_ids(&self) -> Vec<String> {
        self.state
            .iter()
            .filter(|(_, s)| matches!(s, TaskState::Blocked))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskVerdict {
    Pass,
    NeedsFixes,
}

struct TaskSessionOutcome {
    verdict: TaskVerdict,
    token_usage: Vec<(String, i64)>,
}

#[derive(serde::Deserialize)]
struct ReviewVerdict {
    verdict: String,
    #[serde(default)]
    notes: String,
}

#[derive(serde::Serialize)]
struct TaskReviewSummary {
    task_id: String,
    verdict: String,
    attempts: u32,
    diff_path: PathBuf,
}

fn render_task_plan_slice(task: &ImplementationTask) -> String {
    format!(
        "# Task {}: {}\n\n{}\n\n## Files\n{}\n\n## Acceptance criteria\n{}\n",
        task.id,
        task.name,
        task.description,
        task.files.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n"),
        task.acceptance_criteria.iter().map(|c| format!("- {c}")).collect::<Vec<_>>().join("\n"),
    )
}

/// Run one task through its CADRE session: code-writer, test-writer, an
/// optional per-task build check with its own fix-surgeon loop, and
/// code-reviewer — repeating up to `maxRetriesPerTask` times until the
/// reviewer returns `pass` and the build (if checked) is green. Always
/// produces `diff-<id>.patch` and `review-<id>-summary.json`, regardless of
/// the final verdict.
async fn run_task_session(ctx: &PhaseContext<'_>, task: &ImplementationTask) -> Result<TaskSessionOutcome> {
    let task_dir = ctx.progress_dir.join("tasks").join(&task.id);
    let plan_slice_path = task_dir.join(format!("task-{}.md", task.id));
    write_file(&plan_slice_path, &render_task_plan_slice(task))?;

    let mut token_usage = Vec::new();
    let max_attempts = ctx.config.max_retries_per_task.max(1);
    let mut verdict = TaskVerdict::NeedsFixes;
    let mut attempt = 0;

    while attempt < max_attempts {
        attempt += 1;

        let writer_prompt = format!(
            "You are code-writer. Implement task {} ({}) per {}:\n{}",
            task.id,
            task.name,
            plan_slice_path.display(),
            task.description
        );
        let writer_out = task_dir.join(format!("code-writer-{attempt}.md"));
        let writer_result = run_one_shot_agent(ctx, "code-writer", 3, &writer_prompt, &writer_out).await?;
        write_file(&writer_out, &writer_result.stdout)?;
        token_usage.push(("code-writer".to_string(), writer_result.token_usage));

        let test_prompt = format!(
            "You are test-writer. Write tests for task {} ({}) covering: {}",
            task.id,
            task.name,
            task.acceptance_criteria.join("; ")
        );
        let test_out = task_dir.join(format!("test-writer-{attempt}.md"));
        let test_result = run_one_shot_agent(ctx, "test-writer", 3, &test_prompt, &test_out).await?;
        write_file(&test_out, &test_result.stdout)?;
        token_usage.push(("test-writer".to_string(), test_result.token_usage));

        commit_worktree(ctx.worktree_path, &format!("wip: {} — attempt {attempt}", task.name));

        let (build_passed, build_tokens) = run_per_task_build_check(ctx, &task_dir, &task.id).await?;
        token_usage.extend(build_tokens);

        let review_prompt = format!(
            "You are code-reviewer. Review task {} ({}) against its acceptance criteria:\n{}\n\
             Respond with a cadre-json block: {{\"verdict\": \"pass\"|\"needs-fixes\", \"notes\": \"...\"}}",
            task.id,
            task.name,
            task.acceptance_criteria.join("\n")
        );
        let review_path = task_dir.join(format!("review-{}.md", task.id));
        let review_result = run_one_shot_agent(ctx, "code-reviewer", 3, &review_prompt, &review_path).await?;
        write_file(&review_path, &review_result.stdout)?;
        token_usage.push(("code-reviewer".to_string(), review_result.token_usage));

        let review_verdict: ReviewVerdict =
            cadre_json::extract(&review_result.stdout).unwrap_or_else(|_| ReviewVerdict {
                verdict: "needs-fixes".to_string(),
                notes: "no verdict block found in code-reviewer output".to_string(),
            });

        verdict = if review_verdict.verdict == "pass" && build_passed {
            TaskVerdict::Pass
        } else {
            TaskVerdict::NeedsFixes
        };

        if verdict == TaskVerdict::Pass {
            break;
        }

        if attempt < max_attempts {
            let fix_prompt = format!(
                "You are fix-surgeon. issueType=task-review. Task {} needs fixes: {}",
                task.id, review_verdict.notes
            );
            let fix_out = task_dir.join(format!("fix-surgeon-{attempt}.md"));
            let fix_result = run_one_shot_agent(ctx, "fix-surgeon", 3, &fix_prompt, &fix_out).await?;
            write_file(&fix_out, &fix_result.stdout)?;
            token_usage.push(("fix-surgeon".to_string(), fix_result.token_usage));
        }
    }

    let diff_path = task_dir.join(format!("diff-{}.patch", task.id));
    let diff = get_task_diff(ctx.worktree_path, ctx.base_commit);
    write_file(&diff_path, &truncate_diff(&diff))?;

    let verdict_str = if verdict == TaskVerdict::Pass { "pass" } else { "needs-fixes" }.to_string();
    let summary = TaskReviewSummary {
        task_id: task.id.clone(),
        verdict: verdict_str,
        attempts: attempt,
        diff_path: diff_path.clone(),
    };
    write_file(
        &task_dir.join(format!("review-{}-summary.json", task.id)),
        &serde_json::to_string_pretty(&summary)?,
    )?;

    commit_worktree(ctx.worktree_path, &format!("task: {} (#{})", task.name, task.id));

    Ok(TaskSessionOutcome { verdict, token_usage })
}

/// The per-task build check gated by `perTaskBuildCheck`: build, and if it
/// fails, run fix-surgeon and rebuild, up to `maxBuildFixRounds` times.
async fn run_per_task_build_check(
    ctx: &PhaseContext<'_>,
    task_dir: &Path,
    task_id: &str,
) -> Result<(bool, Vec<(String, i64)>)> {
    if !ctx.config.per_task_build_check {
        return Ok((true, Vec::new()));
    }
    let Some(build) = &ctx.config.commands.build else {
        return Ok((true, Vec::new()));
    };

    let mut token_usage = Vec::new();
    let mut rounds = 0;
    loop {
        let (code, stdout, stderr) = run_command_spec(ctx.worktree_path, build);
        if code == Some(0) {
            return Ok((true, token_usage));
        }

        write_file(
            &task_dir.join(format!("build-failure-{task_id}-{rounds}.txt")),
            &format!("{stdout}\n{stderr}"),
        )?;

        if rounds >= ctx.config.max_build_fix_rounds {
            return Ok((false, token_usage));
        }

        let fix_prompt = format!(
            "You are fix-surgeon. issueType=build-failure. Task {task_id} build is broken:\n{stdout}\n{stderr}"
        );
        let fix_out = task_dir.join(format!("fix-build-{task_id}-{rounds}.md"));
        let fix_result = run_one_shot_agent(ctx, "fix-surgeon", 3, &fix_prompt, &fix_out).await?;
        write_file(&fix_out, &fix_result.stdout)?;
        token_usage.push(("fix-surgeon".to_string(), fix_result.token_usage));

        rounds += 1;
    }
}

/// Post-all-tasks whole-PR review, gated by `maxWholePrReviewRetries`. The
/// retry budget covers re-running the *review* itself on transient agent
/// failure; once a verdict comes back `needs-fixes`, exactly one
/// fix-surgeon pass is applied and the review is not repeated. Failures here
/// are logged and otherwise swallowed — this step never fails the phase.
async fn run_whole_pr_review(ctx: &PhaseContext<'_>) -> Result<Vec<(String, i64)>> {
    let mut token_usage = Vec::new();
    if ctx.config.max_whole_pr_review_retries == 0 {
        return Ok(token_usage);
    }

    let diff = truncate_diff(&get_task_diff(ctx.worktree_path, ctx.base_commit));
    let prompt = format!(
        "You are whole-pr-reviewer. Review the full diff for issue #{}:\n{diff}",
        ctx.issue_number
    );
    let output_path = ctx.progress_dir.join("whole-pr-review.md");

    let mut review_stdout = None;
    let mut last_error = None;
    for attempt in 1..=ctx.config.max_whole_pr_review_retries {
        match run_one_shot_agent(ctx, "whole-pr-reviewer", 3, &prompt, &output_path).await {
            Ok(result) => {
                write_file(&output_path, &result.stdout)?;
                token_usage.push(("whole-pr-reviewer".to_string(), result.token_usage));
                review_stdout = Some(result.stdout);
                break;
            }
            Err(e) => {
                tracing::warn!(issue = ctx.issue_number, attempt, error = %e, "whole-pr-reviewer attempt failed");
                last_error = Some(e);
            }
        }
    }

    let Some(stdout) = review_stdout else {
        tracing::warn!(
            issue = ctx.issue_number,
            error = ?last_error.map(|e| e.to_string()),
            "whole-pr review unavailable after {} attempt(s), continuing without it",
            ctx.config.max_whole_pr_review_retries
        );
        return Ok(token_usage);
    };

    let verdict: ReviewVerdict = cadre_json::extract(&stdout).unwrap_or_else(|_| ReviewVerdict {
        verdict: "pass".to_string(),
        notes: String::new(),
    });

    if verdict.verdict == "pass" {
        return Ok(token_usage);
    }

    tracing::warn!(issue = ctx.issue_number, "whole-pr review needs fixes, applying a single fix-surgeon pass");
    let fix_prompt = format!(
        "You are fix-surgeon. issueType=whole-pr-review. Fix the following review feedback:\n{}",
        verdict.notes
    );
    let fix_output = ctx.progress_dir.join("whole-pr-review-fix.md");
    match run_one_shot_agent(ctx, "fix-surgeon", 3, &fix_prompt, &fix_output).await {
        Ok(fix_result) => {
            write_file(&fix_output, &fix_result.stdout)?;
            token_usage.push(("fix-surgeon".to_string(), fix_result.token_usage));
        }
        Err(e) => tracing::warn!(issue = ctx.issue_number, error = %e, "whole-pr-review fix-surgeon failed"),
    }

    Ok(token_usage)
}

// ---------------------------------------------------------------------
// Phase 4: Integration Verification
// ---------------------------------------------------------------------

pub struct IntegrationVerificationPhase;

#[async_trait]
impl PhaseExecutor for IntegrationVerificationPhase {
    fn phase_id(&self) -> u32 {
        4
    }

    fn name(&self) -> &str {
        "integration-verification"
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        let mut report = String::from("# Integration Verification\n\n");
        let mut build_exit = None;
        let mut test_exit = None;
        let mut token_usage = Vec::new();

        for (label, spec, max_fix_rounds) in [
            ("install", &ctx.config.commands.install, 0u32),
            ("build", &ctx.config.commands.build, ctx.config.max_build_fix_rounds),
            ("test", &ctx.config.commands.test, ctx.config.max_build_fix_rounds),
            ("lint", &ctx.config.commands.lint, 0u32),
        ] {
            let Some(spec) = spec else {
                report.push_str(&format!("- {label}: not configured\n"));
                continue;
            };

            let mut rounds = 0;
            loop {
                let (code, stdout, stderr) = run_command_spec(ctx.worktree_path, spec);
                let failed = code != Some(0);
                report.push_str(&format!("- {label}: exit {code:?}\n"));

                if label == "build" {
                    build_exit = code;
                }
                if label == "test" {
                    test_exit = code;
                }

                if !failed || rounds >= max_fix_rounds {
                    if failed {
                        let sidecar = format!("{label}-failure-{}.txt", ctx.issue_number);
                        write_file(&ctx.progress_dir.join(&sidecar), &format!("{stdout}\n{stderr}"))?;
                    }
                    break;
                }

                let sidecar = format!("{label}-failure-{}.txt", ctx.issue_number);
                write_file(&ctx.progress_dir.join(&sidecar), &format!("{stdout}\n{stderr}"))?;

                let fix_prompt = format!(
                    "You are fix-surgeon. issueType={label}-failure. Fix the following failure:\n{stdout}\n{stderr}"
                );
                let fix_output = ctx.progress_dir.join(format!("fix-{label}-{rounds}.md"));
                match run_one_shot_agent(ctx, "fix-surgeon", 4, &fix_prompt, &fix_output).await {
                    Ok(fix_result) => {
                        write_file(&fix_output, &fix_result.stdout)?;
                        token_usage.push(("fix-surgeon".to_string(), fix_result.token_usage));
                    }
                    Err(e) => {
                        tracing::error!(
                            issue = ctx.issue_number,
                            label,
                            error = %e,
                            "fix-surgeon failed to run; stopping fix loop for this check"
                        );
                        report.push_str(&format!("- {label}: fix-surgeon attempt {rounds} failed: {e}\n"));
                        break;
                    }
                }

                rounds += 1;
            }
        }

        let output_path = ctx.progress_dir.join("integration-report.md");
        write_file(&output_path, &report)?;

        Ok(PhaseOutcome {
            output_path,
            build_exit,
            test_exit,
            ambiguity_count: None,
            token_usage,
        })
    }
}

// ---------------------------------------------------------------------
// Phase 5: PR Composition
// ---------------------------------------------------------------------

pub struct PrCompositionPhase;

#[derive(serde::Deserialize)]
struct PrContent {
    title: String,
    body: String,
}

#[async_trait]
impl PhaseExecutor for PrCompositionPhase {
    fn phase_id(&self) -> u32 {
        5
    }

    fn name(&self) -> &str {
        "pr-composition"
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        let diff = get_task_diff(ctx.worktree_path, ctx.base_commit);
        write_file(&ctx.progress_dir.join("whole-pr-diff.patch"), &diff)?;

        let prompt = format!("You are pr-composer. Compose a PR title/body from this diff:\n{diff}");
        let output_path = ctx.progress_dir.join("pr-content.md");
        let pr_result = run_one_shot_agent(ctx, "pr-composer", 5, &prompt, &output_path).await?;
        write_file(&output_path, &pr_result.stdout)?;

        let content: PrContent =
            cadre_json::extract(&pr_result.stdout).context("failed to parse pr-composer output")?;

        if ctx.config.squash_before_pr {
            run_git(ctx.worktree_path, &["reset", "--soft", ctx.base_commit]);
            run_git(ctx.worktree_path, &["commit", "-m", content.title.as_str()]);
        }

        let branch = current_branch(ctx.worktree_path).unwrap_or_default();
        run_git(ctx.worktree_path, &["push", "-u", "origin", branch.as_str()]);

        let mut body = content.body.clone();
        if ctx.config.link_issue {
            body.push_str("\n\n");
            body.push_str(&ctx.platform.issue_link_suffix(ctx.issue_number));
        }

        ctx.platform
            .create_pull_request(crate::platform::CreatePullRequestParams {
                title: content.title,
                body,
                head: branch,
                base: "main".to_string(),
                draft: ctx.config.draft,
                labels: None,
                reviewers: None,
            })
            .await
            .map_err(|e| anyhow::anyhow!("failed to create pull request: {e}"))?;

        Ok(PhaseOutcome {
            output_path,
            token_usage: vec![("pr-composer".to_string(), pr_result.token_usage)],
            ..Default::default()
        })
    }
}

fn current_branch(worktree: &Path) -> Option<String> {
    let (_code, stdout, _stderr) = run_git(worktree, &["rev-parse", "--abbrev-ref", "HEAD"]);
    let branch = stdout.trim().to_string();
    if branch.is_empty() {
        None
    } else {
        Some(branch)
    }
}
