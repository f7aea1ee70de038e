//! The issue/fleet error taxonomy (§7), modeled as one enum in the style of
//! [`crate::worktree::WorktreeError`] / [`crate::token::GuardError`]: each
//! variant owns its structured payload rather than a stringly-typed message.

use thiserror::Error;

use crate::budget::BudgetExceededError;
use crate::issue::gates::GateResult;
use crate::plan::CyclicTaskError;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("cyclic dependency among issues: {0:?}")]
    CyclicIssueDependency(Vec<u64>),

    #[error("cyclic dependency among tasks: {0}")]
    CyclicTaskDependency(#[from] CyclicTaskError),

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceededError),

    #[error("gate validation failed for phase {phase} after retry: {result:?}")]
    GateValidation { phase: u32, result: GateResult },

    #[error("agent {agent} failed: {reason}")]
    AgentFailure { agent: String, reason: String },

    #[error("no such agent backend: {0}")]
    UnknownAgent(String),

    #[error("platform provider error: {0}")]
    Platform(String),

    #[error("scheduler deadlock: ready set is empty but the task queue is not complete")]
    SchedulerDeadlock,
}
