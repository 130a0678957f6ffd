//! Re-triggering of workflow runs that failed because of quota exhaustion.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::{Forge, Repo, WorkflowRun};

/// Upper bound on failure messages quoted in a PR comment.
const MAX_QUOTED_MESSAGES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub pause_secs: u64,
    /// Case-insensitive regexes identifying quota failures.
    pub quota_patterns: Vec<String>,
    /// Identical failure comments are not reposted within this window.
    pub comment_throttle_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause_secs: 30,
            quota_patterns: vec![
                r"rate[ _-]?limit".to_string(),
                r"quota".to_string(),
                r"\b429\b".to_string(),
                r"too many requests".to_string(),
            ],
            comment_throttle_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Quota,
    Other,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    patterns: Vec<Regex>,
}

impl FailureClassifier {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .with_context(|| format!("Invalid quota pattern: '{p}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn classify(&self, messages: &[String]) -> FailureKind {
        let quota = messages
            .iter()
            .any(|msg| self.patterns.iter().any(|re| re.is_match(msg)));
        if quota {
            FailureKind::Quota
        } else {
            FailureKind::Other
        }
    }
}

/// A failed workflow run together with why it failed.
#[derive(Debug, Clone)]
pub struct FailedRun {
    pub run: WorkflowRun,
    pub kind: FailureKind,
    pub messages: Vec<String>,
}

/// Fetches failure messages for every failed run and classifies them.
pub async fn classify_failed_runs<F>(
    forge: &F,
    repo: &Repo,
    runs: &[WorkflowRun],
    classifier: &FailureClassifier,
) -> Result<Vec<FailedRun>>
where
    F: Forge + Sync,
{
    let mut failed = Vec::new();
    for run in runs.iter().filter(|r| r.is_failed()) {
        let messages = forge
            .fetch_failure_messages(repo, run.id)
            .await
            .with_context(|| format!("classify_failed_runs: run {} in {repo}", run.id))?;
        let kind = classifier.classify(&messages);
        debug!(run_id = run.id, workflow = %run.name, ?kind, "Classified failed run");
        failed.push(FailedRun {
            run: run.clone(),
            kind,
            messages,
        });
    }
    Ok(failed)
}

#[derive(Debug)]
pub struct RetryFailure {
    pub run_id: u64,
    pub attempts: u32,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct RetryReport {
    /// Runs whose failed jobs were re-triggered.
    pub succeeded: Vec<u64>,
    /// Runs that exhausted the attempt budget.
    pub failed: Vec<RetryFailure>,
    /// Non-quota failures, left for a comment instead of a retry.
    pub skipped: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct RetryDispatcher {
    max_attempts: u32,
    pause: Duration,
}

impl RetryDispatcher {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            pause: Duration::from_secs(config.pause_secs),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Re-triggers one run, pausing a flat interval between attempts.
    /// Returns the number of attempts used on success.
    pub async fn retry_run<F>(&self, forge: &F, repo: &Repo, run_id: u64) -> Result<u32, RetryFailure>
    where
        F: Forge + Sync,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match forge.rerun_failed_jobs(repo, run_id).await {
                Ok(()) => {
                    info!(run_id, attempt, %repo, "Re-triggered failed jobs");
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(run_id, attempt, %repo, error = %e, "Rerun attempt failed");
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.pause).await;
                    }
                }
            }
        }

        Err(RetryFailure {
            run_id,
            attempts: self.max_attempts,
            error: last_error.unwrap_or_else(|| anyhow::anyhow!("no rerun attempt was made")),
        })
    }

    /// Retries every quota failure and skips the rest.
    pub async fn dispatch<F>(&self, forge: &F, repo: &Repo, runs: &[FailedRun]) -> RetryReport
    where
        F: Forge + Sync,
    {
        let mut report = RetryReport::default();

        for failed in runs {
            if failed.kind != FailureKind::Quota {
                report.skipped.push(failed.run.id);
                continue;
            }

            match self.retry_run(forge, repo, failed.run.id).await {
                Ok(_) => report.succeeded.push(failed.run.id),
                Err(failure) => report.failed.push(failure),
            }
        }

        report
    }
}

/// Builds the PR comment describing failures that a retry will not fix.
pub fn failure_comment(runs: &[&FailedRun]) -> String {
    let mut body = String::from("@copilot The following workflow runs failed on the latest commit:\n");
    for failed in runs {
        body.push_str(&format!("\n- **{}** (run {})\n", failed.run.name, failed.run.id));
        for msg in failed.messages.iter().take(MAX_QUOTED_MESSAGES) {
            let line = msg.lines().next().unwrap_or_default().trim();
            if !line.is_empty() {
                body.push_str(&format!("  - `{line}`\n"));
            }
        }
    }
    body.push_str("\nPlease investigate and push a fix.");
    body
}
