mod common;

use std::collections::BTreeMap;

use common::{MockForge, test_repo};
use prshepherd::{
    FileStatus, IssueFiler, StateStore,
    issues::{
        Finding, IssueConfig, SkipReason, discover_scripts, group_by_file, parse_validator_output,
        run_validator,
    },
};

fn finding(path: &str, line: u32) -> Finding {
    Finding {
        path: path.to_string(),
        line,
        column: 1,
        severity: "warning".to_string(),
        message: "Double quote to prevent globbing and word splitting. [SC2086]".to_string(),
    }
}

fn findings(paths: &[&str]) -> BTreeMap<String, Vec<Finding>> {
    group_by_file(paths.iter().map(|p| finding(p, 3)).collect())
}

fn store_in(dir: &tempfile::TempDir) -> StateStore {
    StateStore::load(dir.path().join("state.json")).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_creates_and_assigns_one_issue_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(&dir);
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig::default();

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&findings(&["scripts/a.sh", "scripts/b.sh"]), &mut store)
        .await;

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        report.created,
        vec![
            ("scripts/a.sh".to_string(), 101),
            ("scripts/b.sh".to_string(), 102)
        ]
    );
    assert_eq!(report.assigned.len(), 2);
    assert_eq!(store.status("scripts/a.sh"), Some(FileStatus::Assigned));
    assert_eq!(store.get("scripts/b.sh").unwrap().issue_number, Some(102));

    let state = forge.state();
    let (_, issue) = &state.created[0];
    assert_eq!(issue.title, "Fix validation findings in scripts/a.sh");
    assert!(issue.body.contains("SC2086"));
    assert_eq!(issue.labels, config.labels);
    assert_eq!(state.assigned[0], (101, vec!["Copilot".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_creation_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(&dir);
    let forge = MockForge::with_prs(vec![]);
    forge.state().fail_create = true;
    let config = IssueConfig::default();

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&findings(&["scripts/a.sh"]), &mut store)
        .await;

    assert!(report.created.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("create_issue"));
    assert_eq!(store.status("scripts/a.sh"), None);
    assert!(store_in(&dir).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_assignment_is_retried_without_a_new_issue() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(&dir);
    let forge = MockForge::with_prs(vec![]);
    forge.state().fail_assign = true;
    let config = IssueConfig::default();
    let files = findings(&["scripts/a.sh"]);

    let first = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    assert_eq!(first.created.len(), 1);
    assert!(first.assigned.is_empty());
    assert_eq!(store.status("scripts/a.sh"), Some(FileStatus::Created));

    forge.state().fail_assign = false;
    let second = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;

    assert!(second.created.is_empty());
    assert_eq!(second.assigned, vec![("scripts/a.sh".to_string(), 101)]);
    assert_eq!(store.status("scripts/a.sh"), Some(FileStatus::Assigned));
    assert_eq!(forge.state().created.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_runs_never_duplicate_issues() {
    let dir = tempfile::tempdir().unwrap();
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig::default();
    let files = findings(&["scripts/a.sh"]);

    let mut store = store_in(&dir);
    IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;

    // Still open: nothing new.
    let mut store = store_in(&dir);
    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    assert_eq!(
        report.skipped,
        vec![("scripts/a.sh".to_string(), SkipReason::AlreadyAssigned)]
    );

    // Closed upstream: refreshed to completed, still nothing new.
    forge.state().closed_issues.insert(101);
    let mut store = store_in(&dir);
    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    assert_eq!(report.completed, vec![("scripts/a.sh".to_string(), 101)]);
    assert_eq!(
        report.skipped,
        vec![("scripts/a.sh".to_string(), SkipReason::Completed)]
    );
    assert_eq!(store.status("scripts/a.sh"), Some(FileStatus::Completed));

    let mut store = store_in(&dir);
    IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;

    assert_eq!(forge.state().created.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_state_file_does_not_duplicate_issues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig::default();
    let files = findings(&["scripts/a.sh"]);

    assert!(StateStore::load(&path).is_err());
    let mut store = StateStore::empty(&path);
    let first = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    assert!(first.unrecorded.is_empty());
    assert_eq!(first.created, vec![("scripts/a.sh".to_string(), 101)]);
    assert!(dir.path().join("state.json.corrupt").exists());

    // The next run loads the rewritten file and sees the open issue.
    let mut store = store_in(&dir);
    let second = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;

    assert_eq!(
        second.skipped,
        vec![("scripts/a.sh".to_string(), SkipReason::AlreadyAssigned)]
    );
    assert_eq!(forge.state().created.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_refiles_completed_file() {
    let dir = tempfile::tempdir().unwrap();
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig::default();
    let files = findings(&["scripts/a.sh"]);

    let mut store = store_in(&dir);
    IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    forge.state().closed_issues.insert(101);
    IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&files, &mut store)
        .await;
    assert_eq!(store.status("scripts/a.sh"), Some(FileStatus::Completed));

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .force(true)
        .file_issues(&files, &mut store)
        .await;

    assert_eq!(report.created, vec![("scripts/a.sh".to_string(), 102)]);
    let record = store.get("scripts/a.sh").unwrap();
    assert_eq!(record.status, FileStatus::Assigned);
    assert_eq!(record.issue_number, Some(102));
    assert_eq!(record.issue_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_limit_defers_remaining_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(&dir);
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig {
        max_issues_per_run: 2,
        ..IssueConfig::default()
    };

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&findings(&["a.sh", "b.sh", "c.sh"]), &mut store)
        .await;

    assert_eq!(report.created.len(), 2);
    assert_eq!(
        report.skipped,
        vec![("c.sh".to_string(), SkipReason::RunLimitReached)]
    );
    assert_eq!(store.status("c.sh"), Some(FileStatus::Pending));

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .file_issues(&findings(&["a.sh", "b.sh", "c.sh"]), &mut store)
        .await;
    assert_eq!(report.created, vec![("c.sh".to_string(), 103)]);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(&dir);
    let forge = MockForge::with_prs(vec![]);
    let config = IssueConfig::default();

    let report = IssueFiler::new(&forge, test_repo(), &config)
        .dry_run(true)
        .file_issues(&findings(&["a.sh", "b.sh"]), &mut store)
        .await;

    assert_eq!(report.planned, vec!["a.sh".to_string(), "b.sh".to_string()]);
    assert!(forge.state().created.is_empty());
    assert!(store.is_empty());
    assert!(!dir.path().join("state.json").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_validator_output_feeds_findings() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("scripts")).unwrap();
    std::fs::create_dir_all(root.join(".git")).unwrap();
    std::fs::write(root.join("scripts/install.sh"), "echo $1\n").unwrap();
    std::fs::write(root.join("scripts/README.md"), "docs\n").unwrap();
    std::fs::write(root.join(".git/hook.sh"), "true\n").unwrap();

    // Stands in for shellcheck: one finding per file, exit status 1.
    let validator: Vec<String> = [
        "sh",
        "-c",
        r#"for f in "$@"; do echo "$f:1:6: warning: Double quote to prevent globbing. [SC2086]"; done; exit 1"#,
        "validator",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let scripts = discover_scripts(root, &["sh".to_string()], &[]).unwrap();
    assert_eq!(scripts, vec![root.join("scripts/install.sh")]);

    let output = run_validator(&validator, root, &scripts).await.unwrap();
    let grouped = group_by_file(parse_validator_output(&output, root));

    assert_eq!(grouped.len(), 1);
    let found = &grouped["scripts/install.sh"];
    assert_eq!(found[0].line, 1);
    assert_eq!(found[0].column, 6);
    assert!(found[0].message.contains("SC2086"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_validator_crash_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let validator = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
    let file = dir.path().join("a.sh");
    std::fs::write(&file, "true\n").unwrap();

    assert!(run_validator(&validator, dir.path(), &[file]).await.is_err());
}
