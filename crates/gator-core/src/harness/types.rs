//! Shared types for the harness adapter interface.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A handle to a spawned agent process.
#[derive(Debug)]
pub struct AgentHandle {
    /// OS process ID.
    pub pid: u32,
    /// Stdin pipe, if the harness supports conversation continuation.
    pub stdin: Option<tokio::process::ChildStdin>,
    /// The task this agent is working on.
    pub task_id: Uuid,
    /// Attempt number for this task.
    pub attempt: u32,
    /// Name of the harness that spawned this agent.
    pub harness_name: String,
}

/// An event emitted by a running agent, translated into the common shape
/// regardless of the underlying harness's wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A conversational message from the agent.
    Message { role: String, content: String },
    /// The agent invoked a tool.
    ToolCall {
        tool: String,
        input: serde_json::Value,
    },
    /// A tool call's result.
    ToolResult {
        tool: String,
        output: serde_json::Value,
    },
    /// Cumulative token usage reported by the agent.
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    /// An error surfaced by the agent or the harness adapter.
    Error { message: String },
    /// The agent's process has exited; this is always the last event.
    Completed,
}

/// A task materialized with everything a harness needs to spawn an agent:
/// the working directory, environment, and invariant commands it will be
/// checked against.
#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub invariant_commands: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}
