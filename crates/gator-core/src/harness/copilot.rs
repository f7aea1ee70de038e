//! GitHub Copilot CLI harness adapter.
//!
//! Spawns `copilot -p --log-level all --allow-all-tools` as a subprocess and
//! parses its line-oriented stdout into [`AgentEvent`] variants. Each output
//! line is expected to be a standalone JSON object; lines that aren't are
//! treated as raw assistant text.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::trait_def::Harness;
use super::types::{AgentEvent, AgentHandle, MaterializedTask};

struct ProcessState {
    child: Child,
    stdout: Option<ChildStdout>,
}

/// Harness adapter for the GitHub Copilot CLI.
#[derive(Clone)]
pub struct CopilotAdapter {
    /// Path to the `copilot` binary. Defaults to `"copilot"` (found via `$PATH`).
    copilot_binary_path: String,
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for CopilotAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopilotAdapter")
            .field("copilot_binary_path", &self.copilot_binary_path)
            .finish()
    }
}

impl CopilotAdapter {
    pub fn new() -> Self {
        Self {
            copilot_binary_path: "copilot".to_string(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            copilot_binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for CopilotAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a single line of Copilot CLI output into zero or more events.
///
/// Lines that parse as JSON are interpreted by their `type`/`event` field;
/// anything else is treated as a raw assistant message line.
fn parse_copilot_line(line: &str) -> Vec<AgentEvent> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
        return vec![AgentEvent::Message {
            role: "assistant".to_string(),
            content: line.to_string(),
        }];
    };

    let kind = v
        .get("type")
        .or_else(|| v.get("event"))
        .and_then(|t| t.as_str())
        .unwrap_or("");

    match kind {
        "message" | "assistant" | "text" => {
            let content = v
                .get("content")
                .or_else(|| v.get("text"))
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            vec![AgentEvent::Message {
                role: "assistant".to_string(),
                content,
            }]
        }
        "tool_call" | "tool_use" => {
            let tool = v
                .get("tool")
                .or_else(|| v.get("name"))
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string();
            let input = v.get("input").or_else(|| v.get("args")).cloned().unwrap_or(serde_json::Value::Null);
            vec![AgentEvent::ToolCall { tool, input }]
        }
        "tool_result" => {
            let tool = v
                .get("tool")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string();
            let output = v.get("output").cloned().unwrap_or(serde_json::Value::Null);
            vec![AgentEvent::ToolResult { tool, output }]
        }
        "usage" | "token_usage" => {
            let input_tokens = v.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
            let output_tokens = v.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
            vec![AgentEvent::TokenUsage {
                input_tokens,
                output_tokens,
            }]
        }
        "error" => {
            let message = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            vec![AgentEvent::Error { message }]
        }
        other => {
            debug!(event_type = other, "ignoring unrecognised copilot event type");
            Vec::new()
        }
    }
}

#[async_trait]
impl Harness for CopilotAdapter {
    fn name(&self) -> &str {
        "copilot"
    }

    async fn spawn(&self, task: &MaterializedTask) -> Result<AgentHandle> {
        let instructions = format!(
            "Task: {name}\n\n{description}\n\nInvariant commands:\n{invariants}",
            name = task.name,
            description = task.description,
            invariants = task
                .invariant_commands
                .iter()
                .map(|c| format!("  - {c}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let mut cmd = Command::new(&self.copilot_binary_path);
        cmd.arg("-p")
            .arg("--log-level")
            .arg("all")
            .arg("--allow-all-tools")
            .arg(&instructions);

        cmd.current_dir(&task.working_dir);

        for (key, value) in &task.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn copilot binary at '{}' -- is it installed and on PATH?",
                self.copilot_binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        {
            let mut processes = self.processes.lock().await;
            processes.insert(pid, ProcessState { child, stdout });
        }

        Ok(AgentHandle {
            pid,
            stdin,
            task_id: task.task_id,
            attempt: 0,
            harness_name: self.name().to_string(),
        })
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available for pid -- events already consumed or process missing");
                yield AgentEvent::Error {
                    message: "stdout not available (already consumed or process not found)".to_string(),
                };
                yield AgentEvent::Completed;
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        for event in parse_copilot_line(trimmed) {
                            yield event;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        yield AgentEvent::Error {
                            message: format!("stdout read error: {e}"),
                        };
                        break;
                    }
                }
            }

            yield AgentEvent::Completed;
        };

        Box::pin(stream)
    }

    async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
        bail!("send() is not supported for CopilotAdapter; each invocation is one-shot")
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(std::time::Duration::from_secs(5), state.child.wait()).await;
            match exited {
                Ok(Ok(_status)) => debug!(pid, "process exited after SIGTERM"),
                _ => {
                    debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }

            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking process status");
                    false
                }
            }
        } else {
            false
        }
    }
}
