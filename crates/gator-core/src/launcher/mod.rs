//! Agent launcher: resolves a backend CLI invocation, builds a scrubbed
//! environment, spawns and waits (with timeout), and reports a structured
//! [`AgentResult`].

pub mod registry;
pub mod tokens;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub use registry::ProcessRegistry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// Environment variables injected by editor/IDE dev tooling that break child
/// agent subprocesses if inherited verbatim.
const ENV_BLOCKLIST: &[&str] = &[
    "VSCODE_INJECTION",
    "VSCODE_IPC_HOOK",
    "VSCODE_IPC_HOOK_CLI",
    "VSCODE_GIT_ASKPASS_NODE",
    "VSCODE_GIT_ASKPASS_MAIN",
    "VSCODE_GIT_IPC_HANDLE",
    "ELECTRON_RUN_AS_NODE",
    "TERM_PROGRAM",
    "TERM_PROGRAM_VERSION",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub issue_number: u64,
    pub phase: u32,
    pub session_id: Option<String>,
    pub context_path: PathBuf,
    pub output_path: PathBuf,
    pub timeout: Option<Duration>,
    pub command: String,
    pub args: Vec<String>,
    pub extra_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub token_usage: i64,
    pub output_path: PathBuf,
    pub output_exists: bool,
    pub error: Option<String>,
}

/// Resolve the CLI command + argument vector for a phase-level agent role
/// (e.g. `issue-analyst`, `implementation-planner`, `fix-surgeon`), given the
/// configured backend (`"claude"` or `"copilot"`) and a rendered prompt.
///
/// These one-shot phase agents are distinct from the streaming per-task
/// [`crate::harness::Harness`] adapters: the launcher waits for exit rather
/// than consuming an event stream.
pub fn resolve_backend_command(backend: &str, prompt: &str) -> Result<(String, Vec<String>)> {
    match backend {
        "claude" => Ok((
            "claude".to_string(),
            vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "--append-system-prompt".to_string(),
                prompt.to_string(),
            ],
        )),
        "copilot" => Ok((
            "copilot".to_string(),
            vec![
                "-p".to_string(),
                "--log-level".to_string(),
                "all".to_string(),
                "--allow-all-tools".to_string(),
                prompt.to_string(),
            ],
        )),
        other => anyhow::bail!("no such agent backend: {other:?}"),
    }
}

/// Resolve the child's environment: inherit the caller's, strip blocklisted
/// dev-editor variables, prepend extra PATH entries, and inject the
/// `CADRE_*` variables the contract names.
fn build_env(invocation: &AgentInvocation, worktree_path: &str) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| !ENV_BLOCKLIST.contains(&k.as_str()))
        .collect();

    if !invocation.extra_path.is_empty() {
        let existing = env.get("PATH").cloned().unwrap_or_default();
        let mut parts = invocation.extra_path.clone();
        parts.push(existing);
        env.insert("PATH".to_string(), parts.join(":"));
    }

    env.insert("CADRE_ISSUE_NUMBER".to_string(), invocation.issue_number.to_string());
    env.insert("CADRE_WORKTREE_PATH".to_string(), worktree_path.to_string());
    env.insert("CADRE_PHASE".to_string(), invocation.phase.to_string());
    if let Some(session_id) = &invocation.session_id {
        env.insert("CADRE_SESSION_ID".to_string(), session_id.clone());
    }

    env
}

/// Launch `invocation` in `cwd`, tracking the child in `registry` for the
/// duration of the call so a global cancel can reach it.
pub async fn launch_agent(
    invocation: &AgentInvocation,
    cwd: &std::path::Path,
    registry: &ProcessRegistry,
) -> Result<AgentResult> {
    let worktree_path = cwd.to_string_lossy().to_string();
    let env = build_env(invocation, &worktree_path);

    let mut cmd = Command::new(&invocation.command);
    cmd.args(&invocation.args)
        .current_dir(cwd)
        .env_clear()
        .envs(&env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn agent backend {}", invocation.command))?;

    let pid = child.id();
    if let Some(pid) = pid {
        registry.register(pid);
    }

    let timeout = invocation.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    if let Some(pid) = pid {
        registry.deregister(pid);
    }

    let duration = started.elapsed();

    let (exit_code, timed_out, stdout, stderr) = match wait_result {
        Ok(Ok(output)) => (
            output.status.code(),
            false,
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ),
        Ok(Err(e)) => {
            return Err(e).with_context(|| format!("failed to wait on agent {}", invocation.agent));
        }
        Err(_) => (None, true, String::new(), String::new()),
    };

    let unknown_agent = stderr.contains("No such agent:");
    let success = exit_code == Some(0) && !timed_out && !unknown_agent;
    let token_usage = tokens::parse_token_usage(&stdout, &stderr);
    let output_exists = invocation.output_path.exists();

    let error = if !success {
        Some(if timed_out {
            format!("agent {} timed out after {:?}", invocation.agent, timeout)
        } else if unknown_agent {
            format!("unknown agent backend: {}", invocation.agent)
        } else {
            format!(
                "agent {} exited with code {:?}",
                invocation.agent, exit_code
            )
        })
    } else {
        None
    };

    let result = AgentResult {
        agent: invocation.agent.clone(),
        success,
        exit_code,
        timed_out,
        duration,
        stdout,
        stderr,
        token_usage,
        output_path: invocation.output_path.clone(),
        output_exists,
        error,
    };

    if let Err(e) = write_invocation_log(invocation, &result).await {
        tracing::warn!(error = %e, "failed to write agent invocation log");
    }

    Ok(result)
}

async fn write_invocation_log(invocation: &AgentInvocation, result: &AgentResult) -> Result<()> {
    let log_path = invocation
        .output_path
        .with_extension("invocation-log.json");
    let json = serde_json::to_vec_pretty(result)?;

    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let mut file = tokio::fs::File::create(&log_path).await?;
    file.write_all(&json).await?;
    Ok(())
}
