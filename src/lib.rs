//! prshepherd: shepherds Copilot-authored pull requests to merge.
//!
//! Lists open pull requests, approves workflow runs waiting for a
//! maintainer, separates stale check failures from current ones, retries
//! runs that failed on API quota, and merges PRs that pass every safety
//! predicate. A second workflow validates shell scripts and files one
//! tracked issue per failing file.

pub mod cli;
pub mod config;
pub mod github;
pub mod issues;
pub mod rate_limit;
pub mod reconcile;
pub mod retry;
pub mod safety;
pub mod state;
pub mod status;
pub mod trust;
pub mod types;

pub use cli::{Command, LogLevel, parse_args};
pub use config::Config;
pub use github::GitHub;
pub use issues::{FilingReport, IssueFiler};
pub use reconcile::{MergeDecision, PrOutcome, ReconcileSpec, Reconciler, RunMode, RunReport};
pub use state::{FileStatus, StateStore};
pub use status::CiStatus;
pub use trust::{TrustPolicy, TrustTier};
pub use types::{
    CheckConclusion, CheckRun, CommentInfo, Forge, MergeMethod, MergeOutcome, MergeableState,
    NewIssue, PullRequest, RateLimitStatus, Repo, RepoError, RunStatus, WorkflowRun,
};
