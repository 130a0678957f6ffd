//! The PR reconciliation loop.
//!
//! One cycle lists candidate pull requests and, for each one in turn, waits
//! for API quota, approves workflow runs that are waiting for a maintainer,
//! resolves check-run status, retries quota failures, comments on other
//! failures, and merges when the safety gate passes. Failures of individual
//! remote calls are recorded in the [`RunReport`] and the cycle carries on.

use std::{future::Future, time::Duration};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    rate_limit::RateLimitGuard,
    retry::{FailureClassifier, FailureKind, RetryDispatcher, classify_failed_runs, failure_comment},
    safety::{GateReport, SafetyGate, SafetyPredicate},
    status::{CiStatus, MixedCheck, StatusAnalysis, analyze_check_runs, analyze_commit},
    trust::TrustTier,
    types::{Forge, PullRequest, Repo, was_comment_posted_recently},
};

/// Whether a run may change anything on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Live,
    /// Decide everything, mutate nothing, log what would have happened.
    DryRun,
    /// Report status only.
    MonitorOnly,
}

impl RunMode {
    pub fn mutates(&self) -> bool {
        matches!(self, RunMode::Live)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSpec {
    pub repo: Repo,
    /// Restrict the cycle to one pull request.
    pub pr: Option<u64>,
    pub mode: RunMode,
    /// Also consider PRs from trusted bots and maintainers, not only Copilot.
    pub include_trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Merged { sha: Option<String> },
    /// The gate passed but the run mode forbids merging.
    WouldMerge,
    Blocked(Vec<SafetyPredicate>),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct PrOutcome {
    pub pr: PullRequest,
    pub tier: TrustTier,
    pub ci_status: CiStatus,
    pub mixed: Vec<MixedCheck>,
    pub approved_runs: Vec<u64>,
    pub retried_runs: Vec<u64>,
    /// Runs that used up every rerun attempt this cycle.
    pub exhausted_runs: Vec<u64>,
    pub commented: bool,
    pub gate: GateReport,
    pub merge: MergeDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub operation: String,
    pub pr: Option<u64>,
    pub message: String,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pr {
            Some(pr) => write!(f, "{} (PR #{}): {}", self.operation, pr, self.message),
            None => write!(f, "{}: {}", self.operation, self.message),
        }
    }
}

/// Everything a run did, accumulated across cycles.
#[derive(Debug, Default)]
pub struct RunReport {
    pub cycles: u32,
    pub outcomes: Vec<PrOutcome>,
    pub errors: Vec<ErrorRecord>,
    pub rate_limit_wait: Duration,
}

impl RunReport {
    pub fn record_error(&mut self, operation: &str, pr: Option<u64>, err: &anyhow::Error) {
        warn!(operation, pr, error = %format!("{err:#}"), "Remote call failed");
        self.errors.push(ErrorRecord {
            operation: operation.to_string(),
            pr,
            message: format!("{err:#}"),
        });
    }

    pub fn merged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.merge, MergeDecision::Merged { .. }))
            .count()
    }

    pub fn absorb(&mut self, other: RunReport) {
        self.cycles += other.cycles;
        self.outcomes.extend(other.outcomes);
        self.errors.extend(other.errors);
        self.rate_limit_wait += other.rate_limit_wait;
    }
}

pub struct Reconciler<'a, F> {
    forge: &'a F,
    config: &'a Config,
    guard: RateLimitGuard,
    dispatcher: RetryDispatcher,
    classifier: FailureClassifier,
    gate: SafetyGate,
}

impl<'a, F> Reconciler<'a, F>
where
    F: Forge + Sync,
{
    pub fn new(forge: &'a F, config: &'a Config) -> Result<Self> {
        Ok(Self {
            forge,
            config,
            guard: RateLimitGuard::new(config.rate_limit.clone()),
            dispatcher: RetryDispatcher::new(&config.retry),
            classifier: FailureClassifier::new(&config.retry.quota_patterns)?,
            gate: SafetyGate::new(&config.safety, config.trust.clone())?,
        })
    }

    fn wanted(&self, spec: &ReconcileSpec, tier: TrustTier) -> bool {
        match tier {
            TrustTier::Copilot => true,
            TrustTier::TrustedBot | TrustTier::Maintainer => spec.include_trusted,
            TrustTier::Untrusted => false,
        }
    }

    async fn guard_quota(&self, report: &mut RunReport, pr: Option<u64>) {
        match self.guard.wait_for_quota(self.forge).await {
            Ok(outcome) => report.rate_limit_wait += outcome.waited(),
            Err(e) => report.record_error("rate_limit", pr, &e),
        }
    }

    /// Open PRs this cycle should look at. A single requested PR is always
    /// a candidate, whatever its author.
    pub async fn list_candidates(
        &self,
        spec: &ReconcileSpec,
        report: &mut RunReport,
    ) -> Vec<PullRequest> {
        self.guard_quota(report, spec.pr).await;

        if let Some(number) = spec.pr {
            return match self.forge.fetch_pull_request(&spec.repo, number).await {
                Ok(pr) => vec![pr],
                Err(e) => {
                    report.record_error("fetch_pull_request", Some(number), &e);
                    Vec::new()
                }
            };
        }

        let prs = match self.forge.list_open_pull_requests(&spec.repo).await {
            Ok(prs) => prs,
            Err(e) => {
                report.record_error("list_open_pull_requests", None, &e);
                return Vec::new();
            }
        };

        let total = prs.len();
        let candidates: Vec<PullRequest> = prs
            .into_iter()
            .filter(|pr| self.wanted(spec, self.config.trust.classify_author(&pr.author_login)))
            .collect();

        info!(repo = %spec.repo, total, candidates = candidates.len(), "Listed pull requests");
        candidates
    }

    /// Posts `body` unless the same comment was posted within the throttle
    /// window. Returns whether a comment was posted.
    async fn post_throttled_comment(&self, pr: &PullRequest, body: &str, report: &mut RunReport) -> bool {
        let comments = match self.forge.fetch_comments(&pr.repo, pr.number).await {
            Ok(comments) => comments,
            Err(e) => {
                report.record_error("fetch_comments", Some(pr.number), &e);
                return false;
            }
        };

        let window = Duration::from_secs(self.config.retry.comment_throttle_secs);
        if was_comment_posted_recently(&comments, body, window) {
            debug!(pr = pr.number, "Same comment posted recently, skipping");
            return false;
        }

        match self.forge.post_comment(&pr.repo, pr.number, body).await {
            Ok(()) => true,
            Err(e) => {
                report.record_error("post_comment", Some(pr.number), &e);
                false
            }
        }
    }

    /// Runs every reconciliation step for one PR.
    pub async fn reconcile_pr(
        &self,
        listed: &PullRequest,
        spec: &ReconcileSpec,
        report: &mut RunReport,
    ) -> Option<PrOutcome> {
        self.guard_quota(report, Some(listed.number)).await;

        // Listing omits size and mergeability; fetch the full record.
        let pr = match self.forge.fetch_pull_request(&listed.repo, listed.number).await {
            Ok(pr) => pr,
            Err(e) => {
                report.record_error("fetch_pull_request", Some(listed.number), &e);
                return None;
            }
        };

        let tier = self.config.trust.classify_author(&pr.author_login);
        let mutate = spec.mode.mutates();

        let workflow_runs = match self.forge.fetch_workflow_runs(&pr.repo, &pr.head_sha).await {
            Ok(runs) => runs,
            Err(e) => {
                report.record_error("fetch_workflow_runs", Some(pr.number), &e);
                Vec::new()
            }
        };

        let mut approved_runs = Vec::new();
        if tier.is_trusted() {
            for run in workflow_runs.iter().filter(|r| r.awaits_approval()) {
                if !mutate {
                    info!(pr = pr.number, run_id = run.id, mode = ?spec.mode, "Would approve workflow run");
                    continue;
                }
                match self.forge.approve_workflow_run(&pr.repo, run.id).await {
                    Ok(()) => {
                        info!(pr = pr.number, run_id = run.id, "Approved workflow run");
                        approved_runs.push(run.id);
                    }
                    Err(e) => report.record_error("approve_workflow_run", Some(pr.number), &e),
                }
            }
        }

        let analysis: StatusAnalysis = match analyze_commit(self.forge, &pr.repo, &pr.head_sha).await {
            Ok(analysis) => analysis,
            Err(e) => {
                report.record_error("fetch_check_runs", Some(pr.number), &e);
                analyze_check_runs(&[])
            }
        };

        let mut commented = false;

        if analysis.has_mixed_status() {
            let names: Vec<&str> = analysis.mixed.iter().map(|m| m.name.as_str()).collect();
            info!(pr = pr.number, checks = ?names, "Stale failures superseded by successful reruns");

            if mutate && self.config.reconcile.comment_on_mixed_status {
                let body = format!(
                    "Checks {} failed earlier but their latest runs succeeded; the old failures are stale.",
                    names.join(", ")
                );
                commented |= self.post_throttled_comment(&pr, &body, report).await;
            }
        }

        let failed_runs = match classify_failed_runs(self.forge, &pr.repo, &workflow_runs, &self.classifier).await {
            Ok(failed) => failed,
            Err(e) => {
                report.record_error("fetch_failure_messages", Some(pr.number), &e);
                Vec::new()
            }
        };

        let mut retried_runs = Vec::new();
        let mut exhausted_runs = Vec::new();

        if !failed_runs.is_empty() {
            if mutate {
                self.guard_quota(report, Some(pr.number)).await;
                let retry = self.dispatcher.dispatch(self.forge, &pr.repo, &failed_runs).await;
                retried_runs = retry.succeeded;
                for failure in retry.failed {
                    report.record_error(
                        "rerun_failed_jobs",
                        Some(pr.number),
                        &failure
                            .error
                            .context(format!("run {} after {} attempts", failure.run_id, failure.attempts)),
                    );
                    exhausted_runs.push(failure.run_id);
                }

                let other: Vec<_> = failed_runs
                    .iter()
                    .filter(|f| f.kind == FailureKind::Other)
                    .collect();
                if !other.is_empty() {
                    let body = failure_comment(&other);
                    commented |= self.post_throttled_comment(&pr, &body, report).await;
                }
            } else {
                for failed in &failed_runs {
                    info!(
                        pr = pr.number,
                        run_id = failed.run.id,
                        kind = ?failed.kind,
                        mode = ?spec.mode,
                        "Would handle failed workflow run"
                    );
                }
            }
        }

        let gate = self.gate.evaluate(&pr, analysis.ci_status);
        let merge = if !gate.passed() {
            debug!(pr = pr.number, failed = %gate.failure_summary(), "Safety gate blocked merge");
            MergeDecision::Blocked(gate.failed())
        } else if !mutate {
            info!(pr = pr.number, mode = ?spec.mode, "Would merge");
            MergeDecision::WouldMerge
        } else {
            match self
                .forge
                .merge_pull_request(&pr.repo, pr.number, self.config.safety.merge_method)
                .await
            {
                Ok(outcome) if outcome.merged => {
                    info!(pr = pr.number, sha = ?outcome.sha, "Merged pull request");
                    MergeDecision::Merged { sha: outcome.sha }
                }
                Ok(outcome) => MergeDecision::Failed(outcome.message),
                Err(e) => {
                    report.record_error("merge_pull_request", Some(pr.number), &e);
                    MergeDecision::Failed(format!("{e:#}"))
                }
            }
        };

        Some(PrOutcome {
            tier,
            ci_status: analysis.ci_status,
            mixed: analysis.mixed,
            approved_runs,
            retried_runs,
            exhausted_runs,
            commented,
            gate,
            merge,
            pr,
        })
    }

    /// One pass over all candidate PRs.
    pub async fn run_cycle(&self, spec: &ReconcileSpec) -> RunReport {
        let mut report = RunReport {
            cycles: 1,
            ..RunReport::default()
        };

        let candidates = self.list_candidates(spec, &mut report).await;
        let pacing = Duration::from_millis(self.config.reconcile.pacing_ms);

        for (i, pr) in candidates.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(pacing).await;
            }
            if let Some(outcome) = self.reconcile_pr(pr, spec, &mut report).await {
                report.outcomes.push(outcome);
            }
        }

        report
    }

    /// Repeats cycles every `interval` until `max_iterations` cycles ran
    /// (0 means no limit) or `shutdown` resolves.
    pub async fn run_daemon(
        &self,
        spec: &ReconcileSpec,
        interval: Duration,
        max_iterations: u32,
        shutdown: impl Future<Output = ()>,
    ) -> RunReport {
        tokio::pin!(shutdown);
        let mut report = RunReport::default();

        loop {
            let cycle = self.run_cycle(spec).await;
            info!(
                cycle = report.cycles + 1,
                prs = cycle.outcomes.len(),
                merged = cycle.merged_count(),
                errors = cycle.errors.len(),
                "Cycle finished"
            );
            report.absorb(cycle);

            if max_iterations != 0 && report.cycles >= max_iterations {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping");
                    break;
                }
            }
        }

        report
    }
}
