//! Check-run resolution and mixed-status detection.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use crate::types::{CheckConclusion, CheckRun, Forge, Repo, RunStatus};

/// Represents the overall CI status of a commit across its authoritative checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Success,
    Failing,
    Pending,
    Unknown,
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CiStatus::Success => write!(f, "Success"),
            CiStatus::Failing => write!(f, "Failing"),
            CiStatus::Pending => write!(f, "Pending"),
            CiStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A check whose latest run succeeded while an older run is still recorded
/// as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixedCheck {
    pub name: String,
    pub latest_run_id: u64,
    pub stale_failed_run_ids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct StatusAnalysis {
    /// The most recent run for each check name, ordered by name.
    pub authoritative: Vec<CheckRun>,
    pub mixed: Vec<MixedCheck>,
    pub ci_status: CiStatus,
}

impl StatusAnalysis {
    pub fn has_mixed_status(&self) -> bool {
        !self.mixed.is_empty()
    }

    pub fn failing_checks(&self) -> impl Iterator<Item = &CheckRun> {
        self.authoritative
            .iter()
            .filter(|run| run.conclusion.is_some_and(|c| c.is_failure()))
    }
}

// Completed runs order by completion time; runs still executing are newer
// than any completed run. Equal timestamps fall back to the run id.
fn recency_key(run: &CheckRun) -> (bool, Option<chrono::DateTime<chrono::Utc>>, u64) {
    (run.completed_at.is_none(), run.completed_at, run.id)
}

fn overall_status(authoritative: &[CheckRun]) -> CiStatus {
    if authoritative.is_empty() {
        return CiStatus::Unknown;
    }

    if authoritative
        .iter()
        .any(|run| run.conclusion.is_some_and(|c| c.is_failure()))
    {
        return CiStatus::Failing;
    }

    let all_passing = authoritative.iter().all(|run| {
        run.status == RunStatus::Completed && run.conclusion.is_some_and(|c| c.is_passing())
    });

    if all_passing {
        CiStatus::Success
    } else {
        CiStatus::Pending
    }
}

/// Groups runs by name, keeps the latest per name and flags mixed status.
pub fn analyze_check_runs(runs: &[CheckRun]) -> StatusAnalysis {
    let mut groups: BTreeMap<&str, Vec<&CheckRun>> = BTreeMap::new();
    for run in runs {
        groups.entry(run.name.as_str()).or_default().push(run);
    }

    let mut authoritative = Vec::with_capacity(groups.len());
    let mut mixed = Vec::new();

    for (name, mut group) in groups {
        group.sort_by_key(|run| recency_key(run));
        let Some((latest, older)) = group.split_last() else {
            continue;
        };

        if latest.conclusion == Some(CheckConclusion::Success) {
            let stale_failed_run_ids: Vec<u64> = older
                .iter()
                .filter(|run| run.conclusion.is_some_and(|c| c.is_failure()))
                .map(|run| run.id)
                .collect();

            if !stale_failed_run_ids.is_empty() {
                debug!(
                    check = name,
                    latest_run_id = latest.id,
                    stale_failures = stale_failed_run_ids.len(),
                    "Mixed status detected"
                );
                mixed.push(MixedCheck {
                    name: name.to_string(),
                    latest_run_id: latest.id,
                    stale_failed_run_ids,
                });
            }
        }

        authoritative.push((*latest).clone());
    }

    let ci_status = overall_status(&authoritative);

    StatusAnalysis {
        authoritative,
        mixed,
        ci_status,
    }
}

/// Fetches all check runs for `sha` and analyses them.
pub async fn analyze_commit<F>(forge: &F, repo: &Repo, sha: &str) -> Result<StatusAnalysis>
where
    F: Forge + Sync,
{
    let runs = forge
        .fetch_check_runs(repo, sha)
        .await
        .with_context(|| format!("analyze_commit: failed to list check runs for {repo}@{sha}"))?;
    Ok(analyze_check_runs(&runs))
}
