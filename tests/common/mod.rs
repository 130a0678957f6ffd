#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use prshepherd::{
    CheckConclusion, CheckRun, CommentInfo, Forge, MergeMethod, MergeOutcome, MergeableState,
    NewIssue, PullRequest, RateLimitStatus, Repo, RunStatus, WorkflowRun, types::IssueState,
};

/// Everything the mock serves and everything it was asked to do.
#[derive(Default)]
pub struct MockState {
    pub prs: Vec<PullRequest>,
    pub check_runs: HashMap<String, Vec<CheckRun>>,
    pub workflow_runs: HashMap<String, Vec<WorkflowRun>>,
    pub failure_messages: HashMap<u64, Vec<String>>,
    /// Remaining quota per `rate_limit` call; the last value repeats.
    pub rate_limits: VecDeque<u64>,
    /// Rerun calls for these run ids always fail.
    pub rerun_broken: HashSet<u64>,
    pub comments: HashMap<u64, Vec<CommentInfo>>,
    pub fail_create: bool,
    pub fail_assign: bool,
    pub closed_issues: HashSet<u64>,
    pub next_issue: u64,

    /// Every call in order, e.g. `rate_limit 50` or `fetch_pull_request 7`.
    pub calls: Vec<String>,
    pub rate_limit_calls: u32,
    pub rerun_calls: Vec<u64>,
    pub approved: Vec<u64>,
    pub posted: Vec<(u64, String)>,
    pub merged: Vec<u64>,
    pub created: Vec<(u64, NewIssue)>,
    pub assigned: Vec<(u64, Vec<String>)>,
}

pub struct MockForge {
    pub state: Mutex<MockState>,
}

impl MockForge {
    pub fn new(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_prs(prs: Vec<PullRequest>) -> Self {
        Self::new(MockState {
            prs,
            next_issue: 100,
            ..MockState::default()
        })
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn list_open_pull_requests(&self, _repo: &Repo) -> Result<Vec<PullRequest>> {
        self.record("list_open_pull_requests".to_string());
        Ok(self.state().prs.clone())
    }

    async fn fetch_pull_request(&self, _repo: &Repo, number: u64) -> Result<PullRequest> {
        self.record(format!("fetch_pull_request {number}"));
        self.state()
            .prs
            .iter()
            .find(|pr| pr.number == number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 pull request #{number} not found"))
    }

    async fn fetch_check_runs(&self, _repo: &Repo, sha: &str) -> Result<Vec<CheckRun>> {
        self.record(format!("fetch_check_runs {sha}"));
        Ok(self.state().check_runs.get(sha).cloned().unwrap_or_default())
    }

    async fn fetch_workflow_runs(&self, _repo: &Repo, sha: &str) -> Result<Vec<WorkflowRun>> {
        self.record(format!("fetch_workflow_runs {sha}"));
        Ok(self
            .state()
            .workflow_runs
            .get(sha)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_failure_messages(&self, _repo: &Repo, run_id: u64) -> Result<Vec<String>> {
        Ok(self
            .state()
            .failure_messages
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn rerun_failed_jobs(&self, _repo: &Repo, run_id: u64) -> Result<()> {
        let mut state = self.state();
        state.rerun_calls.push(run_id);
        if state.rerun_broken.contains(&run_id) {
            anyhow::bail!("403 rerun refused for run {run_id}");
        }
        Ok(())
    }

    async fn approve_workflow_run(&self, _repo: &Repo, run_id: u64) -> Result<()> {
        self.state().approved.push(run_id);
        Ok(())
    }

    async fn fetch_comments(&self, _repo: &Repo, number: u64) -> Result<Vec<CommentInfo>> {
        Ok(self
            .state()
            .comments
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_comment(&self, _repo: &Repo, number: u64, body: &str) -> Result<()> {
        let mut state = self.state();
        state.posted.push((number, body.to_string()));
        state.comments.entry(number).or_default().push(CommentInfo {
            body: body.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn merge_pull_request(
        &self,
        _repo: &Repo,
        number: u64,
        _method: MergeMethod,
    ) -> Result<MergeOutcome> {
        self.state().merged.push(number);
        Ok(MergeOutcome {
            merged: true,
            sha: Some(format!("merge-{number}")),
            message: "Pull Request successfully merged".to_string(),
        })
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        let mut state = self.state();
        state.rate_limit_calls += 1;
        let remaining = if state.rate_limits.len() > 1 {
            state.rate_limits.pop_front().unwrap_or(5000)
        } else {
            state.rate_limits.front().copied().unwrap_or(5000)
        };
        state.calls.push(format!("rate_limit {remaining}"));
        Ok(RateLimitStatus {
            remaining,
            limit: 5000,
            reset_at: Utc::now(),
        })
    }

    async fn create_issue(&self, _repo: &Repo, issue: &NewIssue) -> Result<u64> {
        let mut state = self.state();
        if state.fail_create {
            anyhow::bail!("502 issue creation failed");
        }
        state.next_issue += 1;
        let number = state.next_issue;
        state.created.push((number, issue.clone()));
        Ok(number)
    }

    async fn assign_issue(&self, _repo: &Repo, number: u64, assignees: &[String]) -> Result<()> {
        let mut state = self.state();
        if state.fail_assign {
            anyhow::bail!("422 assignee is not valid");
        }
        state.assigned.push((number, assignees.to_vec()));
        Ok(())
    }

    async fn issue_state(&self, _repo: &Repo, number: u64) -> Result<IssueState> {
        if self.state().closed_issues.contains(&number) {
            Ok(IssueState::Closed)
        } else {
            Ok(IssueState::Open)
        }
    }
}

pub fn test_repo() -> Repo {
    Repo::new("owner", "repo").unwrap()
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
}

/// A Copilot PR that passes every safety predicate once its checks are green.
pub fn copilot_pr(number: u64) -> PullRequest {
    PullRequest {
        repo: test_repo(),
        number,
        title: format!("Fix quoting in script {number}"),
        body: "Quotes variable expansions.".to_string(),
        author_login: "Copilot".to_string(),
        head_branch: format!("copilot/fix-{number}"),
        base_branch: "main".to_string(),
        head_sha: format!("sha-{number}"),
        labels: vec![],
        draft: false,
        mergeable_state: MergeableState::Clean,
        additions: 12,
        deletions: 3,
        changed_files: 1,
        created_at: at(0),
        updated_at: at(0),
        url: format!("https://github.com/owner/repo/pull/{number}"),
    }
}

pub fn check(id: u64, name: &str, conclusion: CheckConclusion, minute: u32) -> CheckRun {
    CheckRun {
        id,
        name: name.to_string(),
        workflow: None,
        status: RunStatus::Completed,
        conclusion: Some(conclusion),
        started_at: Some(at(minute)),
        completed_at: Some(at(minute)),
    }
}

pub fn workflow_run(id: u64, sha: &str, conclusion: CheckConclusion) -> WorkflowRun {
    WorkflowRun {
        id,
        name: "CI".to_string(),
        head_sha: sha.to_string(),
        status: RunStatus::Completed,
        conclusion: Some(conclusion),
    }
}
