use std::fmt::Write;

use serde::Serialize;

use crate::adapter::ToolInvocation;
use crate::aggregator::RunReport;
use crate::normalizer::{Finding, Severity};

/// Output surfaces supported by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Review-comment payload for the code-hosting platform.
    Markdown,
    /// Machine-parseable artifact.
    Json,
}

/// Produce the final report string in the desired format.
pub fn render_report(report: &RunReport, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Markdown => render_markdown(report),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::from(report))?),
    }
}

fn render_markdown(report: &RunReport) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "## Security Scan Report")?;
    writeln!(out)?;

    let counts = severity_counts(&report.findings);
    if report.findings.is_empty() {
        writeln!(out, "No findings at any severity.")?;
    } else {
        writeln!(
            out,
            "{} unique finding(s): {} critical, {} high, {} medium, {} low, {} info",
            report.findings.len(),
            counts[4],
            counts[3],
            counts[2],
            counts[1],
            counts[0]
        )?;
        writeln!(out)?;
        for finding in &report.findings {
            let triage = if finding.needs_triage {
                " _(needs triage)_"
            } else {
                ""
            };
            writeln!(
                out,
                "- **{severity}** `{path}:{start}-{end}` {rule}{triage}",
                severity = finding.severity,
                path = finding.location.path.display(),
                start = finding.location.start_line,
                end = finding.location.end_line,
                rule = finding.rule_id,
                triage = triage,
            )?;
            writeln!(out, "  {}", sanitize(&finding.message))?;
            if let Some(remediation) = &finding.remediation {
                writeln!(out, "  Suggested fix: {}", sanitize(remediation))?;
            }
            let tools: Vec<_> = finding.tools.iter().map(|t| t.as_str()).collect();
            writeln!(out, "  Reported by: {}", tools.join(", "))?;
        }
    }

    let failed = report.failed_invocations();
    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "### Skipped or failed tools")?;
        writeln!(out)?;
        for invocation in failed {
            write_failed_invocation(&mut out, invocation)?;
        }
        writeln!(out)?;
        writeln!(
            out,
            "Findings from these tools may be missing from the report above."
        )?;
    }

    Ok(out)
}

fn write_failed_invocation(out: &mut String, invocation: &ToolInvocation) -> anyhow::Result<()> {
    write!(
        out,
        "- `{}` on `{}`: {:?}",
        invocation.tool,
        invocation.path.display(),
        invocation.status
    )?;
    if let Some(detail) = &invocation.detail {
        write!(out, " ({})", sanitize(detail))?;
    }
    writeln!(out)?;
    Ok(())
}

fn severity_counts(findings: &[Finding]) -> [usize; 5] {
    let mut counts = [0usize; 5];
    for finding in findings {
        let idx = match finding.severity {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        };
        counts[idx] += 1;
    }
    counts
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    findings: &'a [Finding],
    invocations: &'a [ToolInvocation],
    max_severity: Option<Severity>,
}

impl<'a> From<&'a RunReport> for JsonReport<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            findings: &report.findings,
            invocations: &report.invocations,
            max_severity: report.max_severity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::adapter::{InvocationStatus, ToolInvocation};
    use crate::config::ToolKind;
    use crate::normalizer::Location;

    fn sample_report() -> RunReport {
        RunReport {
            findings: vec![Finding {
                rule_id: "move.unchecked-transfer".into(),
                severity: Severity::High,
                location: Location {
                    path: PathBuf::from("a.move"),
                    start_line: 10,
                    end_line: 12,
                },
                message: "transfer amount is not validated".into(),
                remediation: Some("assert the amount first".into()),
                tools: vec![ToolKind::Semgrep, ToolKind::Llm],
                needs_triage: false,
            }],
            invocations: vec![
                ToolInvocation {
                    tool: ToolKind::Semgrep,
                    path: PathBuf::from("a.move"),
                    started_at_ms: 0,
                    finished_at_ms: 100,
                    status: InvocationStatus::Completed,
                    detail: None,
                },
                ToolInvocation {
                    tool: ToolKind::Fuzz,
                    path: PathBuf::from("lib.rs"),
                    started_at_ms: 0,
                    finished_at_ms: 500,
                    status: InvocationStatus::Timeout,
                    detail: Some("exceeded 300s".into()),
                },
            ],
        }
    }

    #[test]
    fn markdown_lists_findings_and_origins() {
        let output = render_report(&sample_report(), OutputFormat::Markdown).unwrap();
        assert!(output.contains("Security Scan Report"));
        assert!(output.contains("**high** `a.move:10-12` move.unchecked-transfer"));
        assert!(output.contains("Reported by: semgrep, llm"));
        assert!(output.contains("Suggested fix: assert the amount first"));
    }

    #[test]
    fn markdown_lists_failed_tools_explicitly() {
        let output = render_report(&sample_report(), OutputFormat::Markdown).unwrap();
        assert!(output.contains("Skipped or failed tools"));
        assert!(output.contains("`fuzz` on `lib.rs`: Timeout"));
        assert!(output.contains("exceeded 300s"));
    }

    #[test]
    fn markdown_handles_empty_reports() {
        let report = RunReport {
            findings: Vec::new(),
            invocations: Vec::new(),
        };
        let output = render_report(&report, OutputFormat::Markdown).unwrap();
        assert!(output.contains("No findings at any severity."));
        assert!(!output.contains("Skipped or failed tools"));
    }

    #[test]
    fn json_report_serializes() {
        let output = render_report(&sample_report(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(value["findings"].is_array());
        assert_eq!(value["max_severity"], serde_json::json!("high"));
        assert_eq!(value["findings"][0]["severity"], serde_json::json!("high"));
    }

    #[test]
    fn multiline_messages_are_flattened() {
        let mut report = sample_report();
        report.findings[0].message = "line one\nline two".into();
        let output = render_report(&report, OutputFormat::Markdown).unwrap();
        assert!(output.contains("line one line two"));
    }
}
