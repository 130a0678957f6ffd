use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    CheckConclusion, CheckRun, CommentInfo, Forge, IssueState, MergeMethod, MergeOutcome,
    MergeableState, NewIssue, PullRequest, RateLimitStatus, Repo, RunStatus, WorkflowRun,
};

const PER_PAGE: u8 = 100;

pub fn get_github_token() -> Result<String> {
    for var in ["GITHUB_TOKEN", "GH_TOKEN"] {
        if let Ok(token) = std::env::var(var)
            && !token.trim().is_empty()
        {
            return Ok(token);
        }
    }

    let output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("GitHub CLI 'gh' not found; install it or set GITHUB_TOKEN")?;

    if !output.status.success() {
        anyhow::bail!("Failed to get GitHub token from gh CLI. Please run 'gh auth login' first");
    }

    let token = String::from_utf8(output.stdout)?.trim().to_string();

    if token.is_empty() {
        anyhow::bail!("Empty token returned from gh CLI");
    }

    Ok(token)
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitWindow,
}

#[derive(Debug, Deserialize)]
struct RateLimitWindow {
    limit: u64,
    remaining: u64,
    reset: i64,
}

#[derive(Debug, Serialize)]
struct PageQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    head_sha: Option<&'a str>,
    per_page: u8,
    page: u32,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    total_count: u64,
    check_runs: Vec<RawCheckRun>,
}

#[derive(Debug, Deserialize)]
struct RawCheckRun {
    id: u64,
    name: String,
    status: Option<String>,
    conclusion: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    #[serde(default)]
    total_count: u64,
    workflow_runs: Vec<RawWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRun {
    id: u64,
    name: Option<String>,
    head_sha: String,
    status: Option<String>,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    id: u64,
    name: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    message: Option<String>,
}

fn convert_run_status(status: Option<&str>) -> RunStatus {
    match status {
        Some("completed") => RunStatus::Completed,
        Some("in_progress") => RunStatus::InProgress,
        _ => RunStatus::Queued,
    }
}

fn convert_check_run(run: RawCheckRun) -> CheckRun {
    CheckRun {
        id: run.id,
        name: run.name,
        workflow: None,
        status: convert_run_status(run.status.as_deref()),
        conclusion: run.conclusion.as_deref().map(CheckConclusion::from_api),
        started_at: run.started_at,
        completed_at: run.completed_at,
    }
}

fn convert_workflow_run(run: RawWorkflowRun) -> WorkflowRun {
    WorkflowRun {
        name: run.name.unwrap_or_else(|| format!("run {}", run.id)),
        id: run.id,
        head_sha: run.head_sha,
        status: convert_run_status(run.status.as_deref()),
        conclusion: run.conclusion.as_deref().map(CheckConclusion::from_api),
    }
}

/// Convert octocrab MergeableState enum to our enum
fn convert_mergeable_state(state: Option<&octocrab::models::pulls::MergeableState>) -> MergeableState {
    use octocrab::models::pulls::MergeableState as OMS;
    match state {
        Some(OMS::Clean) => MergeableState::Clean,
        Some(OMS::Behind) => MergeableState::Behind,
        Some(OMS::Dirty) => MergeableState::Dirty,
        Some(OMS::Blocked) => MergeableState::Blocked,
        Some(OMS::Unstable) => MergeableState::Unstable,
        Some(OMS::Draft) => MergeableState::Draft,
        Some(OMS::HasHooks) => MergeableState::HasHooks,
        _ => MergeableState::Unknown,
    }
}

fn convert_pull_request(repo: &Repo, pr: octocrab::models::pulls::PullRequest) -> PullRequest {
    PullRequest {
        repo: repo.clone(),
        number: pr.number,
        title: pr.title.unwrap_or_default(),
        body: pr.body.unwrap_or_default(),
        author_login: pr
            .user
            .map(|u| u.login)
            .unwrap_or_else(|| "unknown".to_string()),
        head_branch: pr.head.ref_field,
        base_branch: pr.base.ref_field,
        head_sha: pr.head.sha,
        labels: pr
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.name)
            .collect(),
        draft: pr.draft.unwrap_or(false),
        mergeable_state: convert_mergeable_state(pr.mergeable_state.as_ref()),
        additions: pr.additions.unwrap_or(0),
        deletions: pr.deletions.unwrap_or(0),
        changed_files: pr.changed_files.unwrap_or(0),
        created_at: pr.created_at.unwrap_or_else(Utc::now),
        updated_at: pr.updated_at.unwrap_or_else(Utc::now),
        url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
    }
}

/// GitHub REST implementation of [`Forge`].
#[derive(Debug, Clone)]
pub struct GitHub {
    octocrab: Octocrab,
}

impl GitHub {
    /// Creates an authenticated GitHub client using available credentials.
    pub fn connect() -> Result<Self> {
        let token = get_github_token().context("Failed to obtain GitHub authentication token")?;
        let octocrab = Octocrab::builder()
            .personal_token(token)
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self { octocrab })
    }

    // These endpoints answer with an empty JSON object.
    async fn post_without_body(&self, route: &str) -> Result<()> {
        let _: serde_json::Value = self
            .octocrab
            .post::<(), serde_json::Value>(route, None::<&()>)
            .await
            .with_context(|| format!("POST {route}"))?;
        Ok(())
    }
}

#[async_trait]
impl Forge for GitHub {
    async fn list_open_pull_requests(&self, repo: &Repo) -> Result<Vec<PullRequest>> {
        debug!(%repo, "Listing open pull requests");

        let mut prs = Vec::new();
        let mut page_num = 1u32;

        loop {
            let page = self
                .octocrab
                .pulls(repo.owner(), repo.name())
                .list()
                .state(octocrab::params::State::Open)
                .per_page(PER_PAGE)
                .page(page_num)
                .send()
                .await?;

            let page_len = page.items.len();
            prs.extend(page.items.into_iter().map(|pr| convert_pull_request(repo, pr)));

            if page_len < PER_PAGE as usize {
                break;
            }
            page_num += 1;
        }

        debug!(%repo, count = prs.len(), "Listed open pull requests");
        Ok(prs)
    }

    async fn fetch_pull_request(&self, repo: &Repo, number: u64) -> Result<PullRequest> {
        let pr = self
            .octocrab
            .pulls(repo.owner(), repo.name())
            .get(number)
            .await?;
        Ok(convert_pull_request(repo, pr))
    }

    async fn fetch_check_runs(&self, repo: &Repo, sha: &str) -> Result<Vec<CheckRun>> {
        // The endpoint defaults to the latest run per name; mixed-status
        // detection needs every run.
        let route = format!(
            "/repos/{}/{}/commits/{}/check-runs",
            repo.owner(),
            repo.name(),
            sha
        );

        let mut runs = Vec::new();
        let mut page = 1u32;

        loop {
            let query = PageQuery {
                filter: Some("all"),
                head_sha: None,
                per_page: PER_PAGE,
                page,
            };
            let response: CheckRunsResponse = self
                .octocrab
                .get(&route, Some(&query))
                .await
                .with_context(|| format!("fetch_check_runs: {sha} in {repo}, page {page}"))?;

            let page_len = response.check_runs.len();
            runs.extend(response.check_runs.into_iter().map(convert_check_run));

            if page_len < PER_PAGE as usize || runs.len() as u64 >= response.total_count {
                break;
            }
            page += 1;
        }

        debug!(%repo, sha, count = runs.len(), "Fetched check runs");
        Ok(runs)
    }

    async fn fetch_workflow_runs(&self, repo: &Repo, sha: &str) -> Result<Vec<WorkflowRun>> {
        let route = format!("/repos/{}/{}/actions/runs", repo.owner(), repo.name());

        let mut runs = Vec::new();
        let mut page = 1u32;

        loop {
            let query = PageQuery {
                filter: None,
                head_sha: Some(sha),
                per_page: PER_PAGE,
                page,
            };
            let response: WorkflowRunsResponse = self
                .octocrab
                .get(&route, Some(&query))
                .await
                .with_context(|| format!("fetch_workflow_runs: {sha} in {repo}, page {page}"))?;

            let page_len = response.workflow_runs.len();
            runs.extend(response.workflow_runs.into_iter().map(convert_workflow_run));

            if page_len < PER_PAGE as usize || runs.len() as u64 >= response.total_count {
                break;
            }
            page += 1;
        }

        Ok(runs)
    }

    async fn fetch_failure_messages(&self, repo: &Repo, run_id: u64) -> Result<Vec<String>> {
        let route = format!(
            "/repos/{}/{}/actions/runs/{}/jobs",
            repo.owner(),
            repo.name(),
            run_id
        );
        let jobs: JobsResponse = self
            .octocrab
            .get(&route, Some(&[("filter", "latest")]))
            .await?;

        let mut messages = Vec::new();
        for job in jobs.jobs {
            let failed = job
                .conclusion
                .as_deref()
                .is_some_and(|c| CheckConclusion::from_api(c).is_failure());
            if !failed {
                continue;
            }

            messages.push(format!("job '{}' failed", job.name));

            let route = format!(
                "/repos/{}/{}/check-runs/{}/annotations",
                repo.owner(),
                repo.name(),
                job.id
            );
            let annotations: Vec<RawAnnotation> = self.octocrab.get(&route, None::<&()>).await?;
            messages.extend(annotations.into_iter().filter_map(|a| a.message));
        }

        Ok(messages)
    }

    async fn rerun_failed_jobs(&self, repo: &Repo, run_id: u64) -> Result<()> {
        let route = format!(
            "/repos/{}/{}/actions/runs/{}/rerun-failed-jobs",
            repo.owner(),
            repo.name(),
            run_id
        );
        self.post_without_body(&route).await
    }

    async fn approve_workflow_run(&self, repo: &Repo, run_id: u64) -> Result<()> {
        let route = format!(
            "/repos/{}/{}/actions/runs/{}/approve",
            repo.owner(),
            repo.name(),
            run_id
        );
        self.post_without_body(&route).await
    }

    async fn fetch_comments(&self, repo: &Repo, number: u64) -> Result<Vec<CommentInfo>> {
        let page = self
            .octocrab
            .issues(repo.owner(), repo.name())
            .list_comments(number)
            .per_page(PER_PAGE)
            .send()
            .await?;

        Ok(page
            .items
            .into_iter()
            .map(|c| CommentInfo {
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }

    async fn post_comment(&self, repo: &Repo, number: u64, body: &str) -> Result<()> {
        self.octocrab
            .issues(repo.owner(), repo.name())
            .create_comment(number, body)
            .await?;
        Ok(())
    }

    async fn merge_pull_request(
        &self,
        repo: &Repo,
        number: u64,
        method: MergeMethod,
    ) -> Result<MergeOutcome> {
        use octocrab::params::pulls::MergeMethod as OMM;
        let method = match method {
            MergeMethod::Merge => OMM::Merge,
            MergeMethod::Squash => OMM::Squash,
            MergeMethod::Rebase => OMM::Rebase,
        };

        let merge = self
            .octocrab
            .pulls(repo.owner(), repo.name())
            .merge(number)
            .method(method)
            .send()
            .await?;

        Ok(MergeOutcome {
            merged: merge.merged,
            sha: merge.sha,
            message: merge.message.unwrap_or_default(),
        })
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        let response: RateLimitResponse = self.octocrab.get("/rate_limit", None::<&()>).await?;
        let core = response.resources.core;
        Ok(RateLimitStatus {
            remaining: core.remaining,
            limit: core.limit,
            reset_at: DateTime::from_timestamp(core.reset, 0).unwrap_or_else(Utc::now),
        })
    }

    async fn create_issue(&self, repo: &Repo, issue: &NewIssue) -> Result<u64> {
        let created = self
            .octocrab
            .issues(repo.owner(), repo.name())
            .create(&issue.title)
            .body(&issue.body)
            .labels(issue.labels.clone())
            .send()
            .await?;
        Ok(created.number)
    }

    async fn assign_issue(&self, repo: &Repo, number: u64, assignees: &[String]) -> Result<()> {
        let assignees: Vec<&str> = assignees.iter().map(String::as_str).collect();
        self.octocrab
            .issues(repo.owner(), repo.name())
            .add_assignees(number, &assignees)
            .await?;
        Ok(())
    }

    async fn issue_state(&self, repo: &Repo, number: u64) -> Result<IssueState> {
        let issue = self
            .octocrab
            .issues(repo.owner(), repo.name())
            .get(number)
            .await?;
        Ok(match issue.state {
            octocrab::models::IssueState::Closed => IssueState::Closed,
            _ => IssueState::Open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_run_status() {
        assert_eq!(convert_run_status(Some("completed")), RunStatus::Completed);
        assert_eq!(convert_run_status(Some("in_progress")), RunStatus::InProgress);
        assert_eq!(convert_run_status(Some("waiting")), RunStatus::Queued);
        assert_eq!(convert_run_status(None), RunStatus::Queued);
    }

    #[test]
    fn test_rate_limit_response_shape() {
        let json = r#"{
            "resources": {
                "core": {"limit": 5000, "used": 4950, "remaining": 50, "reset": 1735689600},
                "search": {"limit": 30, "used": 0, "remaining": 30, "reset": 1735689600}
            },
            "rate": {"limit": 5000, "used": 4950, "remaining": 50, "reset": 1735689600}
        }"#;
        let parsed: RateLimitResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.resources.core.remaining, 50);
        assert_eq!(parsed.resources.core.limit, 5000);
    }

    #[test]
    fn test_check_runs_response_keeps_every_run_per_name() {
        let json = r#"{
            "total_count": 2,
            "check_runs": [
                {
                    "id": 11, "name": "build", "status": "completed", "conclusion": "success",
                    "started_at": "2025-03-01T12:04:00Z", "completed_at": "2025-03-01T12:05:00Z"
                },
                {
                    "id": 10, "name": "build", "status": "completed", "conclusion": "failure",
                    "started_at": "2025-03-01T12:00:00Z", "completed_at": "2025-03-01T12:01:00Z"
                }
            ]
        }"#;
        let parsed: CheckRunsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.total_count, 2);

        let runs: Vec<CheckRun> = parsed.check_runs.into_iter().map(convert_check_run).collect();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].conclusion, Some(CheckConclusion::Failure));
        assert_eq!(runs[1].status, RunStatus::Completed);

        let analysis = crate::status::analyze_check_runs(&runs);
        assert_eq!(analysis.mixed.len(), 1);
        assert_eq!(analysis.mixed[0].latest_run_id, 11);
        assert_eq!(analysis.mixed[0].stale_failed_run_ids, vec![10]);
    }

    #[test]
    fn test_check_run_in_progress() {
        let json = r#"{"id": 3, "name": "lint", "status": "in_progress", "conclusion": null,
                       "started_at": "2025-03-01T12:00:00Z", "completed_at": null}"#;
        let run = convert_check_run(serde_json::from_str(json).unwrap());
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.conclusion.is_none());
    }

    #[test]
    fn test_page_query_serialises_only_set_filters() {
        let query = PageQuery {
            filter: Some("all"),
            head_sha: None,
            per_page: PER_PAGE,
            page: 2,
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"filter": "all", "per_page": 100, "page": 2})
        );
    }

    #[test]
    fn test_workflow_runs_response_shape() {
        let json = r#"{
            "total_count": 1,
            "workflow_runs": [{
                "id": 42, "name": "CI", "head_sha": "abc",
                "status": "completed", "conclusion": "action_required"
            }]
        }"#;
        let parsed: WorkflowRunsResponse = serde_json::from_str(json).unwrap();
        let run = &parsed.workflow_runs[0];
        assert_eq!(run.id, 42);
        assert_eq!(
            run.conclusion.as_deref().map(CheckConclusion::from_api),
            Some(CheckConclusion::ActionRequired)
        );
    }
}
