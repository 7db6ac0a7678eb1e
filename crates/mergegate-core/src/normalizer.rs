use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::RawFinding;
use crate::config::ToolKind;

/// Shared ordinal severity scale all tool-native labels map onto.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse of a severity label, case-insensitive.
    pub fn parse_lenient(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" | "note" => Some(Severity::Info),
            "low" | "minor" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" | "major" => Some(Severity::High),
            "critical" | "blocker" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical `(path, start-line, end-line)` addressing for a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    pub start_line: u32,
    pub end_line: u32,
}

/// A single reported issue, normalized to the common schema.
///
/// Findings from different tools stay independent until the aggregator
/// deduplicates them; `tools` then lists every contributing origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub location: Location,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
    pub tools: Vec<ToolKind>,
    /// Set when the tool-native severity was unrecognized and defaulted.
    #[serde(default)]
    pub needs_triage: bool,
}

/// Map a tool-native finding into the unified record.
pub fn normalize(tool: ToolKind, raw: &RawFinding) -> Finding {
    let (severity, needs_triage) = map_severity(tool, &raw.severity);
    Finding {
        rule_id: raw.rule_id.clone(),
        severity,
        location: canonical_location(raw),
        message: raw.message.trim().to_string(),
        remediation: raw.remediation.clone(),
        tools: vec![tool],
        needs_triage,
    }
}

/// Tool-specific severity mapping; unknown labels default to medium and are
/// flagged for manual triage.
fn map_severity(tool: ToolKind, label: &str) -> (Severity, bool) {
    let normalized = label.trim().to_ascii_uppercase();
    let mapped = match tool {
        ToolKind::Semgrep => match normalized.as_str() {
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Medium),
            "ERROR" => Some(Severity::High),
            _ => None,
        },
        ToolKind::Fuzz => match normalized.as_str() {
            "CRASH" | "HEAP-BUFFER-OVERFLOW" | "SEGV" => Some(Severity::Critical),
            "OOM" | "TIMEOUT" | "SLOW-UNIT" => Some(Severity::Medium),
            _ => None,
        },
        ToolKind::Llm => Severity::parse_lenient(label),
    };
    match mapped {
        Some(severity) => (severity, false),
        None => (Severity::Medium, true),
    }
}

fn canonical_location(raw: &RawFinding) -> Location {
    let path = raw
        .path
        .strip_prefix("./")
        .map(PathBuf::from)
        .unwrap_or_else(|_| raw.path.clone());
    // Line numbers are one-based; zero means the tool had no line info.
    let mut start = raw.start_line.max(1);
    let mut end = if raw.end_line == 0 { start } else { raw.end_line };
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }
    Location {
        path,
        start_line: start,
        end_line: end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tool_severity: &str, start: u32, end: u32) -> RawFinding {
        RawFinding {
            rule_id: "RULE".into(),
            severity: tool_severity.into(),
            path: PathBuf::from("./src/lib.rs"),
            start_line: start,
            end_line: end,
            message: "  something bad  ".into(),
            remediation: None,
        }
    }

    #[test]
    fn severity_ordering_matches_scale() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn semgrep_severities_map_onto_scale() {
        assert_eq!(
            map_severity(ToolKind::Semgrep, "ERROR"),
            (Severity::High, false)
        );
        assert_eq!(
            map_severity(ToolKind::Semgrep, "warning"),
            (Severity::Medium, false)
        );
        assert_eq!(
            map_severity(ToolKind::Semgrep, "INFO"),
            (Severity::Info, false)
        );
    }

    #[test]
    fn fuzz_crashes_are_critical() {
        assert_eq!(map_severity(ToolKind::Fuzz, "crash"), (Severity::Critical, false));
        assert_eq!(map_severity(ToolKind::Fuzz, "SEGV"), (Severity::Critical, false));
    }

    #[test]
    fn unknown_severity_defaults_to_medium_with_triage_flag() {
        let finding = normalize(ToolKind::Semgrep, &raw("BIZARRE", 3, 5));
        assert_eq!(finding.severity, Severity::Medium);
        assert!(finding.needs_triage);
    }

    #[test]
    fn llm_severities_parse_leniently() {
        assert_eq!(
            map_severity(ToolKind::Llm, " High "),
            (Severity::High, false)
        );
        assert_eq!(
            map_severity(ToolKind::Llm, "blocker"),
            (Severity::Critical, false)
        );
    }

    #[test]
    fn location_is_canonicalized() {
        let finding = normalize(ToolKind::Semgrep, &raw("ERROR", 12, 10));
        assert_eq!(finding.location.path, PathBuf::from("src/lib.rs"));
        assert_eq!(finding.location.start_line, 10);
        assert_eq!(finding.location.end_line, 12);
    }

    #[test]
    fn zero_line_info_becomes_line_one() {
        let finding = normalize(ToolKind::Fuzz, &raw("crash", 0, 0));
        assert_eq!(finding.location.start_line, 1);
        assert_eq!(finding.location.end_line, 1);
    }

    #[test]
    fn message_is_trimmed_and_origin_recorded() {
        let finding = normalize(ToolKind::Llm, &raw("high", 1, 2));
        assert_eq!(finding.message, "something bad");
        assert_eq!(finding.tools, vec![ToolKind::Llm]);
    }
}
