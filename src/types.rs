use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Error produced when a repository identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    #[error("repository must be in format 'owner/repo'")]
    InvalidFormat,
    #[error("repository owner must not be empty")]
    EmptyOwner,
    #[error("repository name must not be empty")]
    EmptyName,
    #[error("URL is not a GitHub pull request URL: {0}")]
    InvalidUrl(String),
}

/// A GitHub repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo {
    owner: String,
    name: String,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, RepoError> {
        let owner = owner.into();
        let name = name.into();
        if owner.trim().is_empty() {
            return Err(RepoError::EmptyOwner);
        }
        if name.trim().is_empty() {
            return Err(RepoError::EmptyName);
        }
        Ok(Self { owner, name })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parses `owner/repo`.
    pub fn parse(s: &str) -> Result<Self, RepoError> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.len() != 2 {
            return Err(RepoError::InvalidFormat);
        }
        Self::new(parts[0], parts[1])
    }

    /// Parses a GitHub URL of the form `https://github.com/owner/repo/pull/N`
    /// and returns the repository and the PR number when present.
    pub fn parse_url(url_str: &str) -> Result<(Self, Option<u64>), RepoError> {
        let url =
            url::Url::parse(url_str).map_err(|_| RepoError::InvalidUrl(url_str.to_string()))?;

        if url.host_str() != Some("github.com") {
            return Err(RepoError::InvalidUrl(url_str.to_string()));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .ok_or_else(|| RepoError::InvalidUrl(url_str.to_string()))?
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            [owner, name] => Ok((Self::new(*owner, *name)?, None)),
            [owner, name, "pull", number] => {
                let number = number
                    .parse()
                    .map_err(|_| RepoError::InvalidUrl(url_str.to_string()))?;
                Ok((Self::new(*owner, *name)?, Some(number)))
            }
            _ => Err(RepoError::InvalidUrl(url_str.to_string())),
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Final outcome of a completed check run or workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Stale,
}

impl CheckConclusion {
    /// Maps the REST API conclusion string. Commit statuses report `error`,
    /// which is treated as a failure.
    pub fn from_api(conclusion: &str) -> Self {
        match conclusion.to_lowercase().as_str() {
            "success" => CheckConclusion::Success,
            "failure" | "error" => CheckConclusion::Failure,
            "cancelled" => CheckConclusion::Cancelled,
            "skipped" => CheckConclusion::Skipped,
            "timed_out" => CheckConclusion::TimedOut,
            "action_required" => CheckConclusion::ActionRequired,
            "stale" => CheckConclusion::Stale,
            _ => CheckConclusion::Neutral,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Failure | CheckConclusion::TimedOut | CheckConclusion::Cancelled
        )
    }

    /// Conclusions that do not block a merge.
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Success | CheckConclusion::Neutral | CheckConclusion::Skipped
        )
    }
}

impl fmt::Display for CheckConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
            CheckConclusion::Neutral => "neutral",
            CheckConclusion::Cancelled => "cancelled",
            CheckConclusion::Skipped => "skipped",
            CheckConclusion::TimedOut => "timed_out",
            CheckConclusion::ActionRequired => "action_required",
            CheckConclusion::Stale => "stale",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

/// A single reported outcome for one named check against a commit.
#[derive(Debug, Clone)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub workflow: Option<String>,
    pub status: RunStatus,
    pub conclusion: Option<CheckConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A GitHub Actions workflow run for a commit.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: String,
    pub head_sha: String,
    pub status: RunStatus,
    pub conclusion: Option<CheckConclusion>,
}

impl WorkflowRun {
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Completed && self.conclusion.is_some_and(|c| c.is_failure())
    }

    /// Runs from untrusted actors wait here until a maintainer approves them.
    pub fn awaits_approval(&self) -> bool {
        self.conclusion == Some(CheckConclusion::ActionRequired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeableState {
    Clean,
    Behind,
    Dirty,
    Blocked,
    Unstable,
    Draft,
    HasHooks,
    Unknown,
}

impl fmt::Display for MergeableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeableState::Clean => "clean",
            MergeableState::Behind => "behind",
            MergeableState::Dirty => "dirty",
            MergeableState::Blocked => "blocked",
            MergeableState::Unstable => "unstable",
            MergeableState::Draft => "draft",
            MergeableState::HasHooks => "has_hooks",
            MergeableState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Pull request information as fetched for one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub repo: Repo,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author_login: String,
    pub head_branch: String,
    pub base_branch: String,
    pub head_sha: String,
    pub labels: Vec<String>,
    pub draft: bool,
    pub mergeable_state: MergeableState,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

impl PullRequest {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    pub fn change_size(&self) -> u64 {
        self.additions + self.deletions
    }
}

#[derive(Debug, Clone)]
pub struct CommentInfo {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Returns true if a comment with the same body was posted within `window`.
pub fn was_comment_posted_recently(
    comments: &[CommentInfo],
    body: &str,
    window: std::time::Duration,
) -> bool {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    let cutoff = Utc::now() - window;
    comments
        .iter()
        .any(|c| c.created_at > cutoff && c.body.trim() == body.trim())
}

/// Remaining quota of the core REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: bool,
    pub sha: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

/// The remote issue/PR/workflow API, abstracted so that the reconciliation
/// logic can run against GitHub or an in-memory double.
#[async_trait]
pub trait Forge {
    async fn list_open_pull_requests(&self, repo: &Repo) -> Result<Vec<PullRequest>>;

    async fn fetch_pull_request(&self, repo: &Repo, number: u64) -> Result<PullRequest>;

    async fn fetch_check_runs(&self, repo: &Repo, sha: &str) -> Result<Vec<CheckRun>>;

    async fn fetch_workflow_runs(&self, repo: &Repo, sha: &str) -> Result<Vec<WorkflowRun>>;

    /// Failed job names and their annotation messages for a workflow run.
    async fn fetch_failure_messages(&self, repo: &Repo, run_id: u64) -> Result<Vec<String>>;

    async fn rerun_failed_jobs(&self, repo: &Repo, run_id: u64) -> Result<()>;

    async fn approve_workflow_run(&self, repo: &Repo, run_id: u64) -> Result<()>;

    async fn fetch_comments(&self, repo: &Repo, number: u64) -> Result<Vec<CommentInfo>>;

    async fn post_comment(&self, repo: &Repo, number: u64, body: &str) -> Result<()>;

    async fn merge_pull_request(
        &self,
        repo: &Repo,
        number: u64,
        method: MergeMethod,
    ) -> Result<MergeOutcome>;

    async fn rate_limit(&self) -> Result<RateLimitStatus>;

    async fn create_issue(&self, repo: &Repo, issue: &NewIssue) -> Result<u64>;

    async fn assign_issue(&self, repo: &Repo, number: u64, assignees: &[String]) -> Result<()>;

    async fn issue_state(&self, repo: &Repo, number: u64) -> Result<IssueState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_parse() {
        let repo = Repo::parse("owner/repo").unwrap();
        assert_eq!(repo.owner(), "owner");
        assert_eq!(repo.name(), "repo");
        assert_eq!(repo.to_string(), "owner/repo");

        assert_eq!(Repo::parse("owner"), Err(RepoError::InvalidFormat));
        assert_eq!(Repo::parse("a/b/c"), Err(RepoError::InvalidFormat));
        assert_eq!(Repo::parse("/repo"), Err(RepoError::EmptyOwner));
        assert_eq!(Repo::parse("owner/"), Err(RepoError::EmptyName));
    }

    #[test]
    fn test_repo_parse_url() {
        let (repo, number) = Repo::parse_url("https://github.com/owner/repo/pull/42").unwrap();
        assert_eq!(repo, Repo::new("owner", "repo").unwrap());
        assert_eq!(number, Some(42));

        let (_, number) = Repo::parse_url("https://github.com/owner/repo").unwrap();
        assert_eq!(number, None);

        assert!(Repo::parse_url("https://gitlab.com/owner/repo/pull/1").is_err());
        assert!(Repo::parse_url("https://github.com/owner/repo/issues/1").is_err());
        assert!(Repo::parse_url("https://github.com/owner/repo/pull/abc").is_err());
    }

    #[test]
    fn test_conclusion_from_api() {
        assert_eq!(CheckConclusion::from_api("SUCCESS"), CheckConclusion::Success);
        assert_eq!(CheckConclusion::from_api("error"), CheckConclusion::Failure);
        assert_eq!(CheckConclusion::from_api("timed_out"), CheckConclusion::TimedOut);
        assert_eq!(CheckConclusion::from_api("whatever"), CheckConclusion::Neutral);
        assert!(CheckConclusion::Cancelled.is_failure());
        assert!(CheckConclusion::Skipped.is_passing());
        assert!(!CheckConclusion::ActionRequired.is_passing());
    }

    #[test]
    fn test_comment_throttle_window() {
        let comments = vec![
            CommentInfo {
                body: "retry please".to_string(),
                created_at: Utc::now() - chrono::Duration::minutes(2),
            },
            CommentInfo {
                body: "old".to_string(),
                created_at: Utc::now() - chrono::Duration::hours(3),
            },
        ];
        let window = std::time::Duration::from_secs(300);

        assert!(was_comment_posted_recently(&comments, " retry please ", window));
        assert!(!was_comment_posted_recently(&comments, "old", window));
        assert!(!was_comment_posted_recently(&comments, "new", window));
    }
}
