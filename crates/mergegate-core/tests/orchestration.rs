use std::path::PathBuf;
use std::sync::Arc;

use mergegate_core::{
    render_report, resolve, Aggregator, ChangeSet, CommandSpec, OutputFormat, RunConfig, Scheduler,
    SemgrepAdapter, Severity, ToolKind,
};

const SEMGREP_FIXTURE: &str = r#"{
    "results": [
        {
            "check_id": "move.lang.security.unchecked-transfer",
            "path": "a.move",
            "start": {"line": 10, "col": 1},
            "end": {"line": 12, "col": 4},
            "extra": {
                "message": "transfer amount is not validated",
                "severity": "ERROR"
            }
        }
    ]
}"#;

fn config_with_stubbed_semgrep(fixture: &std::path::Path) -> RunConfig {
    let mut config = RunConfig::default();
    let semgrep = config.tools.get_mut(&ToolKind::Semgrep).unwrap();
    semgrep.extensions = vec!["move".into()];
    semgrep.command = Some(CommandSpec {
        program: "sh".into(),
        args: vec!["-c".into(), format!("cat {} # {{path}}", fixture.display())],
    });
    config
}

/// One modified `.move` file, semgrep reporting one high finding at lines
/// 10-12, gate threshold medium: the run must produce exactly one finding and
/// a failing exit code.
#[tokio::test]
async fn single_high_finding_fails_the_gate() {
    let temp = tempfile::tempdir().unwrap();
    let fixture = temp.path().join("semgrep.json");
    std::fs::write(&fixture, SEMGREP_FIXTURE).unwrap();

    let config = config_with_stubbed_semgrep(&fixture);
    config.validate().unwrap();

    let changeset =
        ChangeSet::from_descriptor_json(r#"[{"path": "a.move", "status": "modified"}]"#).unwrap();
    let targets = resolve(&changeset, &config);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].tool, ToolKind::Semgrep);
    assert_eq!(targets[0].path, PathBuf::from("a.move"));

    let mut scheduler = Scheduler::new(config.clone());
    scheduler.register(Arc::new(SemgrepAdapter::new()));
    let (_cancel, cancel_rx) = Scheduler::cancellation();
    let outcomes = scheduler.run(targets, cancel_rx).await;

    let mut aggregator = Aggregator::new(config.dedup.clone());
    for outcome in outcomes {
        aggregator.record(outcome);
    }
    let report = aggregator.finalize().unwrap();

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].severity, Severity::High);
    assert_eq!(report.findings[0].location.start_line, 10);
    assert_eq!(report.findings[0].location.end_line, 12);
    assert_eq!(report.exit_code(Severity::Medium), 1);

    let markdown = render_report(&report, OutputFormat::Markdown).unwrap();
    assert!(markdown.contains("a.move:10-12"));
}

#[tokio::test]
async fn clean_scan_passes_the_gate() {
    let temp = tempfile::tempdir().unwrap();
    let fixture = temp.path().join("semgrep.json");
    std::fs::write(&fixture, r#"{"results": []}"#).unwrap();

    let config = config_with_stubbed_semgrep(&fixture);
    let changeset =
        ChangeSet::from_descriptor_json(r#"[{"path": "a.move", "status": "modified"}]"#).unwrap();
    let targets = resolve(&changeset, &config);

    let mut scheduler = Scheduler::new(config.clone());
    scheduler.register(Arc::new(SemgrepAdapter::new()));
    let (_cancel, cancel_rx) = Scheduler::cancellation();
    let outcomes = scheduler.run(targets, cancel_rx).await;

    let mut aggregator = Aggregator::new(config.dedup.clone());
    for outcome in outcomes {
        aggregator.record(outcome);
    }
    let report = aggregator.finalize().unwrap();

    assert!(report.findings.is_empty());
    assert_eq!(report.exit_code(Severity::Medium), 0);
    assert!(report.failed_invocations().is_empty());
}

#[tokio::test]
async fn failed_tool_degrades_to_a_marker_instead_of_aborting() {
    let mut config = RunConfig::default();
    let semgrep = config.tools.get_mut(&ToolKind::Semgrep).unwrap();
    semgrep.extensions = vec!["move".into()];
    semgrep.command = Some(CommandSpec {
        program: "no-such-scanner-binary".into(),
        args: vec![],
    });

    let changeset =
        ChangeSet::from_descriptor_json(r#"[{"path": "a.move", "status": "modified"}]"#).unwrap();
    let targets = resolve(&changeset, &config);

    let mut scheduler = Scheduler::new(config.clone());
    scheduler.register(Arc::new(SemgrepAdapter::new()));
    let (_cancel, cancel_rx) = Scheduler::cancellation();
    let outcomes = scheduler.run(targets, cancel_rx).await;

    let mut aggregator = Aggregator::new(config.dedup.clone());
    for outcome in outcomes {
        aggregator.record(outcome);
    }
    let report = aggregator.finalize().unwrap();

    assert!(report.findings.is_empty());
    assert_eq!(report.failed_invocations().len(), 1);
    let markdown = render_report(&report, OutputFormat::Markdown).unwrap();
    assert!(markdown.contains("Skipped or failed tools"));
    assert_eq!(report.exit_code(Severity::Medium), 0);
}
