//! Repository-platform provider contract.
//!
//! Issue and pull-request operations are expressed behind a trait rather than
//! against a concrete GitHub/GitLab client, which is out of scope here. The
//! fleet and issue pipelines depend only on [`PlatformProvider`]; a concrete
//! adapter is wired in at the CLI boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform provider is not connected")]
    NotConnected,

    #[error("issue #{0} not found")]
    IssueNotFound(u64),

    #[error("platform request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilter {
    pub labels: Vec<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePullRequestParams {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub labels: Option<Vec<String>>,
    pub reviewers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub draft: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestFilter {
    pub state: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewThread {
    pub id: String,
    pub path: String,
    pub line: Option<u32>,
    pub body: String,
    pub resolved: bool,
}

/// Everything the fleet/issue pipelines need from a repository platform.
///
/// Object-safe so it can be held as `Arc<dyn PlatformProvider>`.
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    async fn get_issue(&self, number: u64) -> Result<Issue, PlatformError>;

    async fn list_issues(&self, filter: IssueFilter) -> Result<Vec<Issue>, PlatformError>;

    async fn create_pull_request(
        &self,
        params: CreatePullRequestParams,
    ) -> Result<PullRequest, PlatformError>;

    async fn update_pull_request(
        &self,
        number: u64,
        patch: PullRequestPatch,
    ) -> Result<PullRequest, PlatformError>;

    async fn add_issue_comment(&self, number: u64, body: String) -> Result<(), PlatformError>;

    async fn list_pull_requests(
        &self,
        filter: PullRequestFilter,
    ) -> Result<Vec<PullRequest>, PlatformError>;

    async fn list_pr_review_comments(
        &self,
        number: u64,
    ) -> Result<Vec<ReviewThread>, PlatformError>;

    async fn find_open_pr(
        &self,
        issue_number: u64,
        branch: &str,
    ) -> Result<Option<PullRequest>, PlatformError>;

    /// A platform-appropriate suffix appended to PR bodies to link back to
    /// the originating issue, e.g. `"Closes #42"`.
    fn issue_link_suffix(&self, number: u64) -> String;
}

/// A stub provider for tests and dry runs: every call fails with
/// [`PlatformError::NotConnected`] except `issue_link_suffix`, which is pure.
#[derive(Debug, Default)]
pub struct NullPlatformProvider;

#[async_trait]
impl PlatformProvider for NullPlatformProvider {
    async fn get_issue(&self, _number: u64) -> Result<Issue, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn list_issues(&self, _filter: IssueFilter) -> Result<Vec<Issue>, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn create_pull_request(
        &self,
        _params: CreatePullRequestParams,
    ) -> Result<PullRequest, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn update_pull_request(
        &self,
        _number: u64,
        _patch: PullRequestPatch,
    ) -> Result<PullRequest, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn add_issue_comment(&self, _number: u64, _body: String) -> Result<(), PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn list_pull_requests(
        &self,
        _filter: PullRequestFilter,
    ) -> Result<Vec<PullRequest>, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn list_pr_review_comments(
        &self,
        _number: u64,
    ) -> Result<Vec<ReviewThread>, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    async fn find_open_pr(
        &self,
        _issue_number: u64,
        _branch: &str,
    ) -> Result<Option<PullRequest>, PlatformError> {
        Err(PlatformError::NotConnected)
    }

    fn issue_link_suffix(&self, number: u64) -> String {
        format!("Closes #{number}")
    }
}
