//! Issue/fleet orchestration options (spec's "configuration recognized
//! options" table, §6), passed explicitly into constructors rather than read
//! from an ambient global. The CLI's TOML config loader is the external
//! collaborator that produces one of these.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct CommandsConfig {
    pub install: Option<CommandSpec>,
    pub build: Option<CommandSpec>,
    pub test: Option<CommandSpec>,
    pub lint: Option<CommandSpec>,
}

#[derive(Debug, Clone)]
pub struct CommitTemplate {
    pub commit_type: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_issues: usize,
    pub max_parallel_agents: usize,
    pub max_retries_per_task: u32,
    pub per_task_build_check: bool,
    pub max_build_fix_rounds: u32,
    pub max_whole_pr_review_retries: u32,
    pub token_budget: i64,
    pub halt_on_ambiguity: bool,
    pub ambiguity_threshold: usize,
    pub dry_run: bool,
    pub commit_per_phase: bool,
    pub squash_before_pr: bool,
    pub draft: bool,
    pub link_issue: bool,
    pub commands: CommandsConfig,
    pub branch_template: String,
    pub commit_templates: HashMap<u32, CommitTemplate>,
    pub backend: String,
    pub extra_path: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut commit_templates = HashMap::new();
        commit_templates.insert(1, CommitTemplate { commit_type: "chore".into(), message: "analysis for #{issueNumber}".into() });
        commit_templates.insert(2, CommitTemplate { commit_type: "chore".into(), message: "plan for #{issueNumber}".into() });
        commit_templates.insert(3, CommitTemplate { commit_type: "feat".into(), message: "implement #{issueNumber}".into() });
        commit_templates.insert(4, CommitTemplate { commit_type: "fix".into(), message: "integration fixes for #{issueNumber}".into() });
        commit_templates.insert(5, CommitTemplate { commit_type: "chore".into(), message: "pr composition for #{issueNumber}".into() });

        Self {
            max_parallel_issues: 3,
            max_parallel_agents: 4,
            max_retries_per_task: 2,
            per_task_build_check: true,
            max_build_fix_rounds: 2,
            max_whole_pr_review_retries: 1,
            token_budget: 1_000_000,
            halt_on_ambiguity: false,
            ambiguity_threshold: 5,
            dry_run: false,
            commit_per_phase: true,
            squash_before_pr: false,
            draft: false,
            link_issue: true,
            commands: CommandsConfig::default(),
            branch_template: "cadre/issue-{issue}-{title}".to_string(),
            commit_templates,
            backend: "claude".to_string(),
            extra_path: vec![],
        }
    }
}

impl RuntimeConfig {
    pub fn render_branch_name(&self, issue_number: u64, title: &str) -> String {
        let slug: String = title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        let slug = slug.trim_matches('-').to_string();
        self.branch_template
            .replace("{issue}", &issue_number.to_string())
            .replace("{title}", &slug)
    }

    pub fn render_commit_message(&self, phase: u32, issue_number: u64) -> Option<String> {
        self.commit_templates.get(&phase).map(|tpl| {
            format!(
                "{}: {}",
                tpl.commit_type,
                tpl.message.replace("{issueNumber}", &issue_number.to_string())
            )
        })
    }
}
