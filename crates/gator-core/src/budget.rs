//! Token usage tracking and budget enforcement for the issue pipeline.
//!
//! Distinct from [`crate::token`], which signs agent-mode auth tokens; this
//! module accounts the LLM token usage agents report against a configured
//! per-issue budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("token budget exceeded: used {used} of {budget}")]
pub struct BudgetExceededError {
    pub used: i64,
    pub budget: i64,
}

/// Outcome of a budget check against a recorded usage total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStatus {
    pub ok: bool,
    pub warning: bool,
    pub exceeded: bool,
}

const WARNING_THRESHOLD: f64 = 0.8;

/// Accumulates token usage broken down by issue, agent, and phase.
#[derive(Debug, Default)]
pub struct TokenTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    total: i64,
    by_issue: HashMap<u64, i64>,
    by_agent: HashMap<String, i64>,
    by_phase: HashMap<u32, i64>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` tokens used by `agent` during `phase` of `issue`.
    pub fn record(&self, issue: u64, agent: &str, phase: u32, n: i64) {
        let mut state = self.inner.lock().expect("token tracker mutex poisoned");
        state.total += n;
        *state.by_issue.entry(issue).or_insert(0) += n;
        *state.by_agent.entry(agent.to_string()).or_insert(0) += n;
        *state.by_phase.entry(phase).or_insert(0) += n;
    }

    pub fn total(&self) -> i64 {
        self.inner.lock().expect("token tracker mutex poisoned").total
    }

    pub fn for_issue(&self, issue: u64) -> i64 {
        self.inner
            .lock()
            .expect("token tracker mutex poisoned")
            .by_issue
            .get(&issue)
            .copied()
            .unwrap_or(0)
    }

    /// Usage broken down by phase, aggregated across all issues.
    pub fn by_phase(&self) -> HashMap<u32, i64> {
        self.inner.lock().expect("token tracker mutex poisoned").by_phase.clone()
    }

    /// Usage broken down by agent, aggregated across all issues.
    pub fn by_agent(&self) -> HashMap<String, i64> {
        self.inner.lock().expect("token tracker mutex poisoned").by_agent.clone()
    }

    /// Check `issue`'s recorded usage against `budget`.
    pub fn check_issue_budget(&self, issue: u64, budget: i64) -> BudgetStatus {
        let used = self.for_issue(issue);
        let exceeded = used >= budget;
        let warning = !exceeded && (used as f64) >= (budget as f64) * WARNING_THRESHOLD;
        BudgetStatus {
            ok: !exceeded,
            warning,
            exceeded,
        }
    }
}

/// Wraps a [`TokenTracker`] with a one-shot warning and a latching exceeded
/// flag, so callers can cheaply check `check_budget()` before and after
/// every agent launch.
pub struct BudgetGuard {
    tracker: std::sync::Arc<TokenTracker>,
    issue: u64,
    budget: i64,
    warned: AtomicBool,
    exceeded: AtomicBool,
}

impl BudgetGuard {
    pub fn new(tracker: std::sync::Arc<TokenTracker>, issue: u64, budget: i64) -> Self {
        Self {
            tracker,
            issue,
            budget,
            warned: AtomicBool::new(false),
            exceeded: AtomicBool::new(false),
        }
    }

    /// Record usage and update the guard's latched state. Returns `true` the
    /// first time the warning threshold is crossed (the caller should emit a
    /// `budget-warning` notification exactly then).
    pub fn record(&self, agent: &str, phase: u32, n: i64) -> bool {
        self.tracker.record(self.issue, agent, phase, n);
        let status = self.tracker.check_issue_budget(self.issue, self.budget);

        if status.exceeded {
            self.exceeded.store(true, Ordering::SeqCst);
        }

        if status.warning && !self.warned.swap(true, Ordering::SeqCst) {
            return true;
        }
        false
    }

    /// Returns `Err(BudgetExceededError)` if the budget has been exceeded at
    /// any point so far.
    pub fn check_budget(&self) -> Result<(), BudgetExceededError> {
        if self.exceeded.load(Ordering::SeqCst) {
            return Err(BudgetExceededError {
                used: self.tracker.for_issue(self.issue),
                budget: self.budget,
            });
        }
        Ok(())
    }
}
