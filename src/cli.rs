use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    reconcile::{ReconcileSpec, RunMode},
    types::Repo,
};

/// How much the binary should log to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub interval: Duration,
    /// Stop after this many cycles; 0 runs until interrupted.
    pub max_iterations: u32,
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub spec: ReconcileSpec,
    pub daemon: Option<DaemonSettings>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIssuesRequest {
    pub repo: Repo,
    pub state_file: Option<PathBuf>,
    pub force: bool,
    pub max_issues: Option<usize>,
    pub dry_run: bool,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Reconcile(ReconcileRequest),
    FileIssues(FileIssuesRequest),
}

#[derive(Args, Debug, Clone)]
struct ReconcileArgs {
    /// GitHub repository in format 'owner/repo' (optional when --pr is a URL)
    #[arg(short = 'r', long = "repo", value_name = "OWNER/REPO")]
    pub repo: Option<String>,

    /// Reconcile a single pull request
    #[arg(long, value_name = "PR-NUMBER|PR-URL")]
    pub pr: Option<String>,

    /// Report status without approving, retrying, commenting or merging
    #[arg(long = "monitor-only")]
    pub monitor_only: bool,

    /// Decide everything but change nothing
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Also reconcile PRs from trusted bots and maintainers
    #[arg(long = "include-trusted")]
    pub include_trusted: bool,

    /// Keep running cycles until interrupted
    #[arg(long, help_heading = "Daemon")]
    pub daemon: bool,

    /// Pause between cycles (e.g. 5, 30s, 5m, 2h; unitless implies minutes)
    #[arg(long, default_value = "5m", value_name = "DURATION", help_heading = "Daemon")]
    pub interval: String,

    /// Stop after this many cycles (0 = unlimited)
    #[arg(long = "max-iterations", default_value = "0", value_name = "NUM", help_heading = "Daemon")]
    pub max_iterations: u32,

    /// Policy file (default: .github/prshepherd.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct FileIssuesArgs {
    /// GitHub repository in format 'owner/repo'
    #[arg(short = 'r', long = "repo", value_name = "OWNER/REPO")]
    pub repo: String,

    /// Processing state file (overrides the policy file)
    #[arg(long = "state-file", value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Re-file issues for files already marked completed
    #[arg(long)]
    pub force: bool,

    /// Create at most this many issues in this run
    #[arg(long = "max-issues", value_name = "NUM")]
    pub max_issues: Option<usize>,

    /// Validate and plan, but do not create issues or write state
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Policy file (default: .github/prshepherd.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum CliCommand {
    /// Monitor, retry and merge Copilot pull requests
    Reconcile(ReconcileArgs),
    /// Validate shell scripts and file one issue per failing file
    FileIssues(FileIssuesArgs),
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Shepherd Copilot pull requests to merge: approve workflows, retry quota failures, and merge when safe"
)]
struct CliArgs {
    /// Log debug detail
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log progress
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Parses a duration such as `30s`, `5m` or `2h`. A bare number is minutes.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();

    if let Ok(minutes) = input.parse::<u64>() {
        return Ok(Duration::from_secs(minutes * 60));
    }

    if let Some(seconds_str) = input.strip_suffix('s') {
        let seconds: u64 = seconds_str
            .parse()
            .with_context(|| format!("Invalid seconds: '{}'", seconds_str))?;
        return Ok(Duration::from_secs(seconds));
    }

    if let Some(minutes_str) = input.strip_suffix('m') {
        let minutes: u64 = minutes_str
            .parse()
            .with_context(|| format!("Invalid minutes: '{}'", minutes_str))?;
        return Ok(Duration::from_secs(minutes * 60));
    }

    if let Some(hours_str) = input.strip_suffix('h') {
        let hours: u64 = hours_str
            .parse()
            .with_context(|| format!("Invalid hours: '{}'", hours_str))?;
        return Ok(Duration::from_secs(hours * 3600));
    }

    anyhow::bail!(
        "Invalid duration format '{}'. Supported formats: unitless number (minutes), '30s', '5m', '2h'",
        input
    )
}

fn parse_repo(repo: &str) -> Result<Repo> {
    Repo::parse(repo).map_err(|e| anyhow::anyhow!("Invalid repository format '{}': {}", repo, e))
}

/// Resolves `--repo` and `--pr` into the repository and optional PR number.
fn resolve_target(repo: Option<&str>, pr: Option<&str>) -> Result<(Repo, Option<u64>)> {
    let expected = repo.map(parse_repo).transpose()?;

    let Some(pr) = pr.map(str::trim).filter(|p| !p.is_empty()) else {
        let repo = expected.ok_or_else(|| anyhow::anyhow!("--repo is required"))?;
        return Ok((repo, None));
    };

    if pr.starts_with("https://") {
        let (pr_repo, number) = Repo::parse_url(pr)?;
        let number =
            number.ok_or_else(|| anyhow::anyhow!("URL must contain '/pull/' in the path"))?;
        if let Some(expected) = expected
            && expected != pr_repo
        {
            anyhow::bail!(
                "PR URL {} is from {} but --repo specifies {}",
                pr,
                pr_repo,
                expected
            );
        }
        return Ok((pr_repo, Some(number)));
    }

    let Some(repo) = expected else {
        anyhow::bail!("PR numbers require --repo to be specified");
    };
    let number: u64 = pr
        .parse()
        .with_context(|| format!("Invalid PR number: '{}'", pr))?;
    Ok((repo, Some(number)))
}

fn build_reconcile_request(args: ReconcileArgs) -> Result<ReconcileRequest> {
    let (repo, pr) = resolve_target(args.repo.as_deref(), args.pr.as_deref())?;

    let mode = if args.monitor_only {
        RunMode::MonitorOnly
    } else if args.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Live
    };

    let daemon = if args.daemon {
        if pr.is_some() {
            anyhow::bail!("Cannot use --daemon with --pr");
        }
        let interval = parse_duration(&args.interval)?;
        if interval.is_zero() {
            anyhow::bail!("--interval must be greater than zero");
        }
        Some(DaemonSettings {
            interval,
            max_iterations: args.max_iterations,
        })
    } else {
        None
    };

    Ok(ReconcileRequest {
        spec: ReconcileSpec {
            repo,
            pr,
            mode,
            include_trusted: args.include_trusted,
        },
        daemon,
        config_path: args.config,
    })
}

fn build_file_issues_request(args: FileIssuesArgs) -> Result<FileIssuesRequest> {
    Ok(FileIssuesRequest {
        repo: parse_repo(&args.repo)?,
        state_file: args.state_file,
        force: args.force,
        max_issues: args.max_issues,
        dry_run: args.dry_run,
        config_path: args.config,
    })
}

/// Parses command-line arguments into a validated command and log level.
pub fn parse_args<I, T>(args: I) -> Result<(Command, LogLevel)>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = CliArgs::try_parse_from(args)?;

    let level = match (cli.debug, cli.verbose) {
        (true, _) => LogLevel::Debug,
        (_, true) => LogLevel::Info,
        _ => LogLevel::Warn,
    };

    let command = match cli.command {
        CliCommand::Reconcile(args) => Command::Reconcile(build_reconcile_request(args)?),
        CliCommand::FileIssues(args) => Command::FileIssues(build_file_issues_request(args)?),
    };

    Ok((command, level))
}
