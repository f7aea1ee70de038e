//! Durable, crash-safe checkpoint state for issues and the fleet.
//!
//! State is serialized to JSON and persisted with the atomic
//! temp-write + fsync + rename pattern so a crash mid-write never leaves a
//! truncated or corrupt checkpoint on disk.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write checkpoint at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize checkpoint: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("checkpoint version mismatch at {path}: expected {expected}, found {found}")]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateResult {
    pub status: GateStatus,
    pub errors_count: u32,
    pub warnings_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsageBreakdown {
    pub total: i64,
    pub by_phase: HashMap<u32, i64>,
    pub by_agent: HashMap<String, i64>,
}

/// Per-issue checkpoint, persisted at `<progressDir>/checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub issue_number: u64,
    pub current_phase: u32,
    pub current_task: Option<String>,
    pub completed_phases: HashSet<u32>,
    pub completed_tasks: HashSet<String>,
    pub failed_tasks: HashSet<String>,
    pub blocked_tasks: HashSet<String>,
    pub phase_outputs: HashMap<u32, PathBuf>,
    pub token_usage: TokenUsageBreakdown,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub base_commit: Option<String>,
    pub gate_results: HashMap<u32, GateResult>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    pub resume_count: u32,
    pub budget_exceeded: bool,
}

impl CheckpointState {
    pub fn new(issue_number: u64, now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            issue_number,
            current_phase: 1,
            current_task: None,
            completed_phases: HashSet::new(),
            completed_tasks: HashSet::new(),
            failed_tasks: HashSet::new(),
            blocked_tasks: HashSet::new(),
            phase_outputs: HashMap::new(),
            token_usage: TokenUsageBreakdown::default(),
            worktree_path: None,
            branch_name: None,
            base_commit: None,
            gate_results: HashMap::new(),
            started_at: now,
            last_checkpoint: now,
            resume_count: 0,
            budget_exceeded: false,
        }
    }

    pub fn start_phase(&mut self, phase: u32, now: DateTime<Utc>) {
        self.current_phase = phase;
        self.last_checkpoint = now;
    }

    pub fn complete_phase(&mut self, phase: u32, output_path: PathBuf, now: DateTime<Utc>) {
        self.completed_phases.insert(phase);
        self.phase_outputs.insert(phase, output_path);
        self.last_checkpoint = now;
    }

    pub fn start_task(&mut self, task_id: &str, now: DateTime<Utc>) {
        self.current_task = Some(task_id.to_string());
        self.last_checkpoint = now;
    }

    pub fn complete_task(&mut self, task_id: &str, now: DateTime<Utc>) {
        self.completed_tasks.insert(task_id.to_string());
        self.failed_tasks.remove(task_id);
        if self.current_task.as_deref() == Some(task_id) {
            self.current_task = None;
        }
        self.last_checkpoint = now;
    }

    pub fn block_task(&mut self, task_id: &str, now: DateTime<Utc>) {
        self.blocked_tasks.insert(task_id.to_string());
        if self.current_task.as_deref() == Some(task_id) {
            self.current_task = None;
        }
        self.last_checkpoint = now;
    }

    pub fn record_token_usage(&mut self, phase: u32, agent: &str, n: i64, now: DateTime<Utc>) {
        self.token_usage.total += n;
        *self.token_usage.by_phase.entry(phase).or_insert(0) += n;
        *self.token_usage.by_agent.entry(agent.to_string()).or_insert(0) += n;
        self.last_checkpoint = now;
    }

    pub fn record_gate_result(&mut self, phase: u32, result: GateResult, now: DateTime<Utc>) {
        self.gate_results.insert(phase, result);
        self.last_checkpoint = now;
    }

    pub fn set_worktree_info(
        &mut self,
        worktree_path: PathBuf,
        branch_name: String,
        base_commit: String,
        now: DateTime<Utc>,
    ) {
        self.worktree_path = Some(worktree_path);
        self.branch_name = Some(branch_name);
        self.base_commit = Some(base_commit);
        self.last_checkpoint = now;
    }

    pub fn is_phase_completed(&self, phase: u32) -> bool {
        self.completed_phases.contains(&phase)
    }
}

/// Fleet-level checkpoint, persisted at `<repo>/.cadre/fleet-checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetCheckpointState {
    pub version: u32,
    pub project_name: String,
    pub issues: HashMap<u64, FleetIssueEntry>,
    pub token_usage_total: i64,
    pub token_usage_by_issue: HashMap<u64, i64>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    pub resume_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetIssueEntry {
    pub status: IssueStatus,
    pub issue_title: String,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub last_phase: u32,
    pub pr_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Blocked,
    BudgetExceeded,
    CodeCompleteNoPr,
}

impl IssueStatus {
    /// Terminal statuses end a wave for that issue (§4.1).
    pub fn is_terminal(self) -> bool {
        !matches!(self, IssueStatus::NotStarted | IssueStatus::InProgress)
    }
}

impl FleetCheckpointState {
    pub fn new(project_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            project_name: project_name.into(),
            issues: HashMap::new(),
            token_usage_total: 0,
            token_usage_by_issue: HashMap::new(),
            started_at: now,
            last_checkpoint: now,
        }
    }

    pub fn record_token_usage(&mut self, issue: u64, n: i64, now: DateTime<Utc>) {
        self.token_usage_total += n;
        *self.token_usage_by_issue.entry(issue).or_insert(0) += n;
        self.last_checkpoint = now;
    }

    pub fn set_issue_status(&mut self, issue: u64, status: IssueStatus, now: DateTime<Utc>) {
        if let Some(entry) = self.issues.get_mut(&issue) {
            entry.status = status;
        }
        self.last_checkpoint = now;
    }
}

/// Atomically persist any serializable checkpoint value: serialize, write to
/// `<path>.tmp`, fsync, then rename over the target.
pub fn save<T: Serialize>(path: &Path, state: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_vec_pretty(state)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|e| CheckpointError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;
    file.write_all(&json).map_err(|e| CheckpointError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;
    file.sync_all().map_err(|e| CheckpointError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| CheckpointError::Write {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Load a checkpoint file, constructing a fresh value via `default_fn` if the
/// file does not exist. Rejects a version mismatch rather than silently
/// adopting a foreign schema.
pub fn load_or_default<T, F>(
    path: &Path,
    expected_version: u32,
    get_version: impl Fn(&T) -> u32,
    default_fn: F,
) -> Result<T, CheckpointError>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce() -> T,
{
    match std::fs::read(path) {
        Ok(bytes) => {
            let state: T = serde_json::from_slice(&bytes)?;
            let found = get_version(&state);
            if found != expected_version {
                return Err(CheckpointError::VersionMismatch {
                    path: path.to_path_buf(),
                    expected: expected_version,
                    found,
                });
            }
            Ok(state)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default_fn()),
        Err(e) => Err(CheckpointError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
