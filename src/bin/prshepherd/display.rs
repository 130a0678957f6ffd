use std::io::{self, IsTerminal, Write};

use anyhow::Result;
use chrono::{DateTime, Utc};
use prshepherd::{FilingReport, MergeDecision, PrOutcome, RunReport, issues::SkipReason};

const TABLE_HEADERS: &[&str] = &[
    "URL", "CI", "TIER", "MIXED", "GATE", "MERGE", "AUTHOR", "CREATED", "TITLE",
];
const TITLE_COLUMN_INDEX: usize = TABLE_HEADERS.len() - 1;
const COLUMN_SEPARATOR: &str = "  ";
const TITLE_TRUNCATION_SUFFIX: &str = "...";
const MIN_TITLE_WIDTH_FOR_TRUNCATION: usize = 3;

fn format_relative_time(time: DateTime<Utc>) -> String {
    use chrono_humanize::HumanTime;
    HumanTime::from(time).to_string()
}

fn get_terminal_width(width_override: Option<usize>) -> usize {
    if let Some(width) = width_override {
        width
    } else if io::stdout().is_terminal() {
        terminal_size::terminal_size()
            .map(|(w, _)| w.0 as usize)
            .unwrap_or(usize::MAX)
    } else {
        std::env::var("COLUMNS")
            .ok()
            .and_then(|c| c.parse().ok())
            .unwrap_or(usize::MAX)
    }
}

fn format_merge(decision: &MergeDecision) -> String {
    match decision {
        MergeDecision::Merged { .. } => "merged".to_string(),
        MergeDecision::WouldMerge => "ready".to_string(),
        MergeDecision::Blocked(_) => "blocked".to_string(),
        MergeDecision::Failed(_) => "failed".to_string(),
    }
}

fn outcome_to_table_row(outcome: &PrOutcome) -> Vec<String> {
    let pr = &outcome.pr;
    let mixed = if outcome.mixed.is_empty() { "N" } else { "Y" };
    let gate = if outcome.gate.passed() {
        "✓".to_string()
    } else {
        format!("✗ {}", outcome.gate.failed().len())
    };

    vec![
        pr.url.clone(),
        outcome.ci_status.to_string(),
        outcome.tier.to_string(),
        mixed.to_string(),
        gate,
        format_merge(&outcome.merge),
        pr.author_login.clone(),
        format_relative_time(pr.created_at),
        pr.title.clone(),
    ]
}

fn calculate_column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    widths
}

fn apply_title_truncation(rows: &mut [Vec<String>], widths: &mut [usize], terminal_width: usize) {
    if terminal_width == usize::MAX {
        return;
    }

    let separator_width = COLUMN_SEPARATOR.len() * (widths.len() - 1);
    let non_title_width: usize =
        widths[..TITLE_COLUMN_INDEX].iter().sum::<usize>() + separator_width;

    if non_title_width >= terminal_width {
        return;
    }

    let available_title_width = terminal_width - non_title_width;
    let max_title_width = rows
        .iter()
        .map(|row| row.get(TITLE_COLUMN_INDEX).map_or(0, |s| s.chars().count()))
        .max()
        .unwrap_or(0);

    if max_title_width > available_title_width
        && available_title_width > MIN_TITLE_WIDTH_FOR_TRUNCATION
    {
        widths[TITLE_COLUMN_INDEX] = available_title_width;

        for row in rows {
            if let Some(title) = row.get_mut(TITLE_COLUMN_INDEX)
                && title.chars().count() > available_title_width
            {
                let keep = available_title_width - TITLE_TRUNCATION_SUFFIX.len();
                let head: String = title.chars().take(keep).collect();
                *title = format!("{head}{TITLE_TRUNCATION_SUFFIX}");
            }
        }
    }
}

fn render_row<W: Write>(cells: &[String], widths: &[usize], writer: &mut W) -> Result<()> {
    for (i, cell) in cells.iter().enumerate() {
        if i < cells.len() - 1 {
            let pad = widths[i].saturating_sub(cell.chars().count());
            write!(writer, "{}{}{COLUMN_SEPARATOR}", cell, " ".repeat(pad))?;
        } else {
            write!(writer, "{cell}")?;
        }
    }
    writeln!(writer)?;
    Ok(())
}

fn display_outcomes_with_width<W: Write>(
    outcomes: &[PrOutcome],
    writer: &mut W,
    width_override: Option<usize>,
) -> Result<()> {
    let terminal_width = get_terminal_width(width_override);
    let mut rows: Vec<Vec<String>> = outcomes.iter().map(outcome_to_table_row).collect();
    let mut widths = calculate_column_widths(TABLE_HEADERS, &rows);

    apply_title_truncation(&mut rows, &mut widths, terminal_width);

    let headers: Vec<String> = TABLE_HEADERS.iter().map(|h| h.to_string()).collect();
    render_row(&headers, &widths, writer)?;
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    render_row(&separator, &widths, writer)?;
    for row in &rows {
        render_row(row, &widths, writer)?;
    }

    Ok(())
}

/// Prints one row per reconciled PR.
pub fn display_monitor_table<W: Write>(outcomes: &[PrOutcome], writer: &mut W) -> Result<()> {
    if outcomes.is_empty() {
        writeln!(writer, "No pull requests to reconcile.")?;
        return Ok(());
    }
    display_outcomes_with_width(outcomes, writer, None)
}

/// Prints what the run did and every error it collected.
pub fn display_run_summary<W: Write>(report: &RunReport, writer: &mut W) -> Result<()> {
    let approved: usize = report.outcomes.iter().map(|o| o.approved_runs.len()).sum();
    let retried: usize = report.outcomes.iter().map(|o| o.retried_runs.len()).sum();
    let exhausted: usize = report.outcomes.iter().map(|o| o.exhausted_runs.len()).sum();
    let commented = report.outcomes.iter().filter(|o| o.commented).count();

    writeln!(writer)?;
    writeln!(
        writer,
        "Cycles: {}  PRs: {}  Merged: {}  Approved runs: {}  Retried runs: {}  Exhausted runs: {}  Comments: {}",
        report.cycles,
        report.outcomes.len(),
        report.merged_count(),
        approved,
        retried,
        exhausted,
        commented
    )?;

    if !report.rate_limit_wait.is_zero() {
        writeln!(
            writer,
            "Waited {}s for API quota",
            report.rate_limit_wait.as_secs()
        )?;
    }

    for outcome in &report.outcomes {
        if let MergeDecision::Blocked(failed) = &outcome.merge
            && !failed.is_empty()
        {
            writeln!(
                writer,
                "#{} blocked: {}",
                outcome.pr.number,
                outcome.gate.failure_summary()
            )?;
        }
        if let MergeDecision::Failed(message) = &outcome.merge {
            writeln!(writer, "#{} merge failed: {}", outcome.pr.number, message)?;
        }
    }

    if !report.errors.is_empty() {
        writeln!(writer, "Errors ({}):", report.errors.len())?;
        for error in &report.errors {
            writeln!(writer, "  {error}")?;
        }
    }

    Ok(())
}

fn skip_reason(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Completed => "completed",
        SkipReason::AlreadyAssigned => "already assigned",
        SkipReason::RunLimitReached => "run limit reached",
    }
}

pub fn display_filing_report<W: Write>(report: &FilingReport, writer: &mut W) -> Result<()> {
    for (path, number) in &report.created {
        writeln!(writer, "created   #{number:<6} {path}")?;
    }
    for (path, number) in &report.assigned {
        writeln!(writer, "assigned  #{number:<6} {path}")?;
    }
    for (path, number) in &report.completed {
        writeln!(writer, "completed #{number:<6} {path}")?;
    }
    for (path, number) in &report.unrecorded {
        writeln!(writer, "UNRECORDED #{number:<5} {path} (close or record it by hand)")?;
    }
    for path in &report.planned {
        writeln!(writer, "would file        {path}")?;
    }
    for (path, reason) in &report.skipped {
        writeln!(writer, "skipped           {path} ({})", skip_reason(*reason))?;
    }

    writeln!(
        writer,
        "Created: {}  Assigned: {}  Completed: {}  Skipped: {}",
        report.created.len(),
        report.assigned.len(),
        report.completed.len(),
        report.skipped.len()
    )?;

    if !report.errors.is_empty() {
        writeln!(writer, "Errors ({}):", report.errors.len())?;
        for error in &report.errors {
            writeln!(writer, "  {error}")?;
        }
    }

    Ok(())
}
