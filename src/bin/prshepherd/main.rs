mod display;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prshepherd::{
    Command, Config, Forge, GitHub, IssueFiler, LogLevel, Reconciler, StateStore,
    cli::{FileIssuesRequest, ReconcileRequest},
    issues::{
        discover_scripts, ensure_repository_root, group_by_file, parse_validator_output,
        run_validator, state_dir,
    },
    parse_args,
};
use tracing::{info, warn};

use display::{display_filing_report, display_monitor_table, display_run_summary};

fn handle_clap_help_version(clap_err: &clap::Error) -> ! {
    use clap::error::ErrorKind;
    match clap_err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{clap_err}");
            std::process::exit(0);
        }
        _ => {
            eprint!("{clap_err}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Connects and proves the credentials work before anything else runs.
async fn connect() -> Result<GitHub> {
    let github = GitHub::connect()?;
    let quota = github
        .rate_limit()
        .await
        .context("GitHub authentication failed")?;
    info!(remaining = quota.remaining, limit = quota.limit, "Authenticated");
    Ok(github)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C; stop with --max-iterations");
        std::future::pending::<()>().await;
    }
}

async fn reconcile(request: ReconcileRequest) -> Result<()> {
    let config = Config::load(request.config_path.as_deref())?;
    let github = connect().await?;
    let reconciler = Reconciler::new(&github, &config)?;

    let report = match &request.daemon {
        Some(daemon) => {
            reconciler
                .run_daemon(
                    &request.spec,
                    daemon.interval,
                    daemon.max_iterations,
                    shutdown_signal(),
                )
                .await
        }
        None => reconciler.run_cycle(&request.spec).await,
    };

    let mut stdout = std::io::stdout();
    display_monitor_table(&report.outcomes, &mut stdout)?;
    display_run_summary(&report, &mut stdout)?;

    Ok(())
}

async fn file_issues(request: FileIssuesRequest) -> Result<()> {
    let root = std::env::current_dir().context("Failed to determine working directory")?;
    ensure_repository_root(&root)?;

    let mut config = Config::load(request.config_path.as_deref())?;
    if let Some(max) = request.max_issues {
        config.issues.max_issues_per_run = max;
    }
    let state_path = request
        .state_file
        .clone()
        .unwrap_or_else(|| config.issues.state_file.clone());

    let skip: Vec<PathBuf> = state_dir(&root, &state_path).into_iter().collect();
    let scripts = discover_scripts(&root, &config.issues.extensions, &skip)?;
    info!(count = scripts.len(), "Discovered scripts");
    let output = run_validator(&config.issues.validator, &root, &scripts).await?;
    let findings = group_by_file(parse_validator_output(&output, Path::new(&root)));
    info!(files = findings.len(), "Files with findings");

    let github = connect().await?;

    let mut load_error = None;
    let mut store = match StateStore::load(&state_path) {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "Continuing with empty state");
            load_error = Some(format!("load_state: {e}"));
            StateStore::empty(&state_path)
        }
    };

    let filer = IssueFiler::new(&github, request.repo.clone(), &config.issues)
        .force(request.force)
        .dry_run(request.dry_run);
    let mut report = filer.file_issues(&findings, &mut store).await;
    if let Some(err) = load_error {
        report.errors.insert(0, err);
    }

    display_filing_report(&report, &mut std::io::stdout())?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (command, level) = match parse_args(std::env::args()) {
        Ok(result) => result,
        Err(err) => {
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                handle_clap_help_version(clap_err);
            } else {
                return Err(err);
            }
        }
    };

    init_tracing(level);

    match command {
        Command::Reconcile(request) => reconcile(request).await,
        Command::FileIssues(request) => file_issues(request).await,
    }
}
