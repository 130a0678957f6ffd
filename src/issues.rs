//! Files issues for shell scripts that fail validation.
//!
//! The validator is run over every script in the repository, its findings
//! are grouped per file, and each file is driven through
//! pending → created → assigned → completed in the [`StateStore`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    state::{FileStatus, StateStore},
    types::{Forge, IssueState, NewIssue, Repo},
};

/// Directories never searched for scripts.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IssueConfig {
    /// Validator command; script paths are appended as arguments.
    pub validator: Vec<String>,
    pub extensions: Vec<String>,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub max_issues_per_run: usize,
    pub pacing_ms: u64,
    pub state_file: PathBuf,
}

impl Default for IssueConfig {
    fn default() -> Self {
        Self {
            validator: vec!["shellcheck".to_string(), "-f".to_string(), "gcc".to_string()],
            extensions: vec!["sh".to_string()],
            labels: vec!["validation".to_string(), "copilot".to_string()],
            assignees: vec!["Copilot".to_string()],
            max_issues_per_run: 5,
            pacing_ms: 2000,
            state_file: PathBuf::from(".prshepherd/state.json"),
        }
    }
}

/// One problem reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub severity: String,
    pub message: String,
}

fn finding_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<sev>\w+):\s*(?P<msg>.+)$")
            .expect("finding regex is valid")
    })
}

fn relative_path(raw: &str, root: &Path) -> String {
    let path = Path::new(raw);
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel.strip_prefix("./").unwrap_or(rel);
    rel.to_string_lossy().replace('\\', "/")
}

/// Parses `path:line:col: severity: message` lines. Anything else is ignored.
pub fn parse_validator_output(output: &str, root: &Path) -> Vec<Finding> {
    output
        .lines()
        .filter_map(|line| {
            let caps = finding_regex().captures(line.trim())?;
            Some(Finding {
                path: relative_path(&caps["path"], root),
                line: caps["line"].parse().ok()?,
                column: caps["col"].parse().ok()?,
                severity: caps["sev"].to_lowercase(),
                message: caps["msg"].trim().to_string(),
            })
        })
        .collect()
}

pub fn group_by_file(findings: Vec<Finding>) -> BTreeMap<String, Vec<Finding>> {
    let mut grouped: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
    for finding in findings {
        grouped.entry(finding.path.clone()).or_default().push(finding);
    }
    grouped
}

/// Fails unless `dir` is the root of a git working tree.
pub fn ensure_repository_root(dir: &Path) -> Result<()> {
    if !dir.join(".git").exists() {
        anyhow::bail!(
            "{} is not a repository root; run from the top of the working tree",
            dir.display()
        );
    }
    Ok(())
}

/// Recursively lists files under `root` with one of `extensions`, sorted.
pub fn discover_scripts(root: &Path, extensions: &[String], skip: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            // Symlinks are never descended; a link back up the tree would loop.
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let ignored = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| SKIPPED_DIRS.contains(&n));
                if !ignored && !skip.contains(&path) {
                    pending.push(path);
                }
            } else if path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.iter().any(|x| x == e))
            {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Directory holding the state file, resolved against `root`. `None` when
/// the state file sits in `root` itself.
pub fn state_dir(root: &Path, state_file: &Path) -> Option<PathBuf> {
    state_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| root.join(parent))
}

/// Runs the validator over `files` and returns its stdout. Exit codes 0 and
/// 1 both mean the validator ran; 1 conventionally signals findings.
pub async fn run_validator(command: &[String], root: &Path, files: &[PathBuf]) -> Result<String> {
    let (program, args) = command
        .split_first()
        .context("Validator command is empty")?;

    if files.is_empty() {
        return Ok(String::new());
    }

    let output = tokio::process::Command::new(program)
        .args(args)
        .args(files)
        .current_dir(root)
        .output()
        .await
        .with_context(|| format!("Failed to run validator '{program}'; is it installed?"))?;

    match output.status.code() {
        Some(0 | 1) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        code => anyhow::bail!(
            "Validator '{}' failed with {:?}: {}",
            program,
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

pub fn issue_for(path: &str, findings: &[Finding], labels: &[String]) -> NewIssue {
    let mut body = format!(
        "The validator reported {} finding(s) in `{}`:\n\n",
        findings.len(),
        path
    );
    for f in findings {
        body.push_str(&format!(
            "- line {}, column {} ({}): {}\n",
            f.line, f.column, f.severity, f.message
        ));
    }
    NewIssue {
        title: format!("Fix validation findings in {path}"),
        body,
        labels: labels.to_vec(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Completed,
    AlreadyAssigned,
    RunLimitReached,
}

#[derive(Debug, Default)]
pub struct FilingReport {
    pub created: Vec<(String, u64)>,
    pub assigned: Vec<(String, u64)>,
    pub completed: Vec<(String, u64)>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Files a dry run would have filed issues for.
    pub planned: Vec<String>,
    /// Issues created remotely whose state could not be written.
    pub unrecorded: Vec<(String, u64)>,
    pub errors: Vec<String>,
}

pub struct IssueFiler<'a, F> {
    forge: &'a F,
    repo: Repo,
    config: &'a IssueConfig,
    force: bool,
    dry_run: bool,
}

impl<'a, F> IssueFiler<'a, F>
where
    F: Forge + Sync,
{
    pub fn new(forge: &'a F, repo: Repo, config: &'a IssueConfig) -> Self {
        Self {
            forge,
            repo,
            config,
            force: false,
            dry_run: false,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Marks assigned files completed once their issue has been closed.
    pub async fn refresh_completed(&self, store: &mut StateStore, report: &mut FilingReport) {
        let assigned: Vec<(String, u64)> = store
            .records()
            .filter(|(_, r)| r.status == FileStatus::Assigned)
            .filter_map(|(k, r)| r.issue_number.map(|n| (k.clone(), n)))
            .collect();

        for (path, number) in assigned {
            match self.forge.issue_state(&self.repo, number).await {
                Ok(IssueState::Closed) => {
                    if self.dry_run {
                        continue;
                    }
                    match store.transition(&path, FileStatus::Completed, None) {
                        Ok(_) => {
                            info!(path, issue = number, "Issue closed, file completed");
                            report.completed.push((path, number));
                        }
                        Err(e) => report.errors.push(format!("refresh_completed: {e}")),
                    }
                }
                Ok(IssueState::Open) => debug!(path, issue = number, "Issue still open"),
                Err(e) => {
                    warn!(path, issue = number, error = %e, "Failed to query issue state");
                    report
                        .errors
                        .push(format!("refresh_completed: issue #{number}: {e:#}"));
                }
            }
        }
    }

    async fn assign(&self, path: &str, number: u64, store: &mut StateStore, report: &mut FilingReport) {
        if let Err(e) = self
            .forge
            .assign_issue(&self.repo, number, &self.config.assignees)
            .await
        {
            warn!(path, issue = number, error = %e, "Failed to assign issue");
            report
                .errors
                .push(format!("assign_issue: #{number} for {path}: {e:#}"));
            return;
        }

        match store.transition(path, FileStatus::Assigned, None) {
            Ok(_) => report.assigned.push((path.to_string(), number)),
            Err(e) => report.errors.push(format!("assign_issue: {e}")),
        }
    }

    /// Files and assigns issues for every file with findings.
    pub async fn file_issues(
        &self,
        findings: &BTreeMap<String, Vec<Finding>>,
        store: &mut StateStore,
    ) -> FilingReport {
        let mut report = FilingReport::default();
        self.refresh_completed(store, &mut report).await;

        let pacing = Duration::from_millis(self.config.pacing_ms);
        let mut created_this_run = 0;

        for (path, file_findings) in findings {
            let status = store.status(path);

            match status {
                Some(FileStatus::Completed) if !self.force => {
                    report.skipped.push((path.clone(), SkipReason::Completed));
                    continue;
                }
                Some(FileStatus::Assigned) => {
                    report
                        .skipped
                        .push((path.clone(), SkipReason::AlreadyAssigned));
                    continue;
                }
                Some(FileStatus::Created) => {
                    let Some(number) = store.get(path).and_then(|r| r.issue_number) else {
                        report
                            .errors
                            .push(format!("file_issues: {path} is created without an issue number"));
                        continue;
                    };
                    if !self.dry_run {
                        self.assign(path, number, store, &mut report).await;
                    }
                    continue;
                }
                _ => {}
            }

            if created_this_run >= self.config.max_issues_per_run {
                // Track it so the next run picks it up.
                if !self.dry_run
                    && let Err(e) = store.ensure_pending(path)
                {
                    report.errors.push(format!("file_issues: {e}"));
                }
                report
                    .skipped
                    .push((path.clone(), SkipReason::RunLimitReached));
                continue;
            }

            if self.dry_run {
                report.planned.push(path.clone());
                created_this_run += 1;
                continue;
            }

            if created_this_run > 0 {
                tokio::time::sleep(pacing).await;
            }

            let issue = issue_for(path, file_findings, &self.config.labels);
            let number = match self.forge.create_issue(&self.repo, &issue).await {
                Ok(number) => number,
                Err(e) => {
                    warn!(path, error = %e, "Failed to create issue");
                    report
                        .errors
                        .push(format!("create_issue: {path}: {e:#}"));
                    continue;
                }
            };
            created_this_run += 1;

            let recorded = if status == Some(FileStatus::Completed) {
                store
                    .reset(path)
                    .and_then(|_| store.transition(path, FileStatus::Created, Some(number)))
            } else {
                store.transition(path, FileStatus::Created, Some(number))
            };

            match recorded {
                Ok(_) => {
                    info!(path, issue = number, "Created issue");
                    report.created.push((path.clone(), number));
                }
                Err(e) => {
                    warn!(path, issue = number, error = %e, "Issue created but not recorded");
                    report.errors.push(format!(
                        "create_issue: issue #{number} for {path} created but not recorded: {e}"
                    ));
                    report.unrecorded.push((path.clone(), number));
                    continue;
                }
            }

            self.assign(path, number, store, &mut report).await;
        }

        report
    }
}
