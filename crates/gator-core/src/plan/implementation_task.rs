//! The phase-3 implementation task DAG, as emitted by the planning phase's
//! `cadre-json` block and consumed by the task scheduler.
//!
//! Distinct from [`super::toml_format::TaskToml`] (an author-facing plan
//! format parsed from TOML); `ImplementationTask` is agent-authored JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImplementationTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub files: Vec<String>,
    pub dependencies: Vec<String>,
    pub complexity: TaskComplexity,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("dependency cycle detected involving tasks: {0:?}")]
pub struct CyclicTaskError(pub Vec<String>);

/// Kahn's-algorithm topological sort. Returns the task ids in dependency
/// order, or the residual (cyclic) ids on failure.
pub fn topological_sort(tasks: &[ImplementationTask]) -> Result<Vec<String>, CyclicTaskError> {
    use std::collections::{HashMap, VecDeque};

    let index_of: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                dependents[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(idx) = queue.pop_front() {
        order.push(tasks[idx].id.clone());
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != tasks.len() {
        let residual: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg > 0)
            .map(|(i, _)| tasks[i].id.clone())
            .collect();
        return Err(CyclicTaskError(residual));
    }

    Ok(order)
}
