//! Auto-merge eligibility checklist.
//!
//! A pull request may be merged automatically only when every predicate in
//! [`SafetyPredicate::ALL`] holds. The evaluation is a plain conjunction: no
//! predicate is weighted and the result does not depend on evaluation order.

use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::{
    status::CiStatus,
    trust::TrustPolicy,
    types::{MergeMethod, MergeableState, PullRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyPredicate {
    TrustedAuthor,
    NotDraft,
    CleanMergeState,
    ChangeSizeWithinLimit,
    TrustedTargetBranch,
    TitleAllowed,
    BodyHasNoRiskyKeywords,
    ChecksGreen,
}

impl SafetyPredicate {
    pub const ALL: [SafetyPredicate; 8] = [
        SafetyPredicate::TrustedAuthor,
        SafetyPredicate::NotDraft,
        SafetyPredicate::CleanMergeState,
        SafetyPredicate::ChangeSizeWithinLimit,
        SafetyPredicate::TrustedTargetBranch,
        SafetyPredicate::TitleAllowed,
        SafetyPredicate::BodyHasNoRiskyKeywords,
        SafetyPredicate::ChecksGreen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyPredicate::TrustedAuthor => "trusted-author",
            SafetyPredicate::NotDraft => "not-draft",
            SafetyPredicate::CleanMergeState => "clean-merge-state",
            SafetyPredicate::ChangeSizeWithinLimit => "change-size-within-limit",
            SafetyPredicate::TrustedTargetBranch => "trusted-target-branch",
            SafetyPredicate::TitleAllowed => "title-allowed",
            SafetyPredicate::BodyHasNoRiskyKeywords => "body-has-no-risky-keywords",
            SafetyPredicate::ChecksGreen => "checks-green",
        }
    }
}

impl fmt::Display for SafetyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// Maximum additions + deletions.
    pub max_change_size: u64,
    pub trusted_branches: Vec<String>,
    /// Regexes; the title must match at least one.
    pub title_patterns: Vec<String>,
    /// Case-insensitive substrings that must not occur in the PR body.
    pub risky_keywords: Vec<String>,
    pub merge_method: MergeMethod,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_change_size: 500,
            trusted_branches: vec!["main".to_string()],
            title_patterns: vec![
                r"^(Fix|Add|Update|Improve|Refactor|Remove|Document)\b".to_string(),
                r"(?i)^\[?copilot\]?:?\s".to_string(),
            ],
            risky_keywords: vec![
                "breaking change".to_string(),
                "security".to_string(),
                "credential".to_string(),
                "password".to_string(),
                "secret".to_string(),
                "force push".to_string(),
                "rm -rf".to_string(),
                "drop table".to_string(),
            ],
            merge_method: MergeMethod::Squash,
        }
    }
}

/// Per-predicate outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub results: Vec<(SafetyPredicate, bool)>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|(_, ok)| *ok)
    }

    pub fn failed(&self) -> Vec<SafetyPredicate> {
        self.results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn failure_summary(&self) -> String {
        self.failed()
            .iter()
            .map(SafetyPredicate::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    trust: TrustPolicy,
    max_change_size: u64,
    trusted_branches: Vec<String>,
    title_patterns: Vec<Regex>,
    risky_keywords: Vec<String>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig, trust: TrustPolicy) -> Result<Self> {
        let title_patterns = config
            .title_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid title pattern: '{p}'")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            trust,
            max_change_size: config.max_change_size,
            trusted_branches: config.trusted_branches.clone(),
            title_patterns,
            risky_keywords: config
                .risky_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        })
    }

    fn holds(&self, predicate: SafetyPredicate, pr: &PullRequest, ci_status: CiStatus) -> bool {
        match predicate {
            SafetyPredicate::TrustedAuthor => {
                self.trust.classify_author(&pr.author_login).is_trusted()
            }
            SafetyPredicate::NotDraft => !pr.draft,
            SafetyPredicate::CleanMergeState => pr.mergeable_state == MergeableState::Clean,
            SafetyPredicate::ChangeSizeWithinLimit => pr.change_size() <= self.max_change_size,
            SafetyPredicate::TrustedTargetBranch => {
                self.trusted_branches.iter().any(|b| b == &pr.base_branch)
            }
            SafetyPredicate::TitleAllowed => {
                self.title_patterns.iter().any(|re| re.is_match(&pr.title))
            }
            SafetyPredicate::BodyHasNoRiskyKeywords => {
                let body = pr.body.to_lowercase();
                !self.risky_keywords.iter().any(|k| body.contains(k.as_str()))
            }
            SafetyPredicate::ChecksGreen => ci_status == CiStatus::Success,
        }
    }

    /// Evaluates every predicate; `ci_status` is the verdict over the
    /// authoritative check runs of the PR head.
    pub fn evaluate(&self, pr: &PullRequest, ci_status: CiStatus) -> GateReport {
        GateReport {
            results: SafetyPredicate::ALL
                .iter()
                .map(|p| (*p, self.holds(*p, pr, ci_status)))
                .collect(),
        }
    }
}
