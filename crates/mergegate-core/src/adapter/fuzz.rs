use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};

use super::{
    clip_detail, run_with_timeout, CommandWait, InvocationOutcome, InvocationStatus,
    InvocationTimer, RawFinding, ToolAdapter,
};
use crate::config::{CommandSpec, ToolConfig, ToolKind};
use crate::resolver::ScanTarget;

const DEFAULT_FUZZ_SECONDS: u64 = 60;

/// Adapter driving `cargo fuzz` with a bounded time budget.
///
/// The target path names a fuzz-target source file; its stem is the cargo-fuzz
/// target name. Crashing inputs surface as findings, a clean bounded run is a
/// completed invocation with none.
#[derive(Debug, Default)]
pub struct FuzzAdapter;

impl FuzzAdapter {
    pub fn new() -> Self {
        Self
    }

    fn command(target: &ScanTarget, config: &ToolConfig) -> (String, Vec<String>) {
        if let Some(spec) = &config.command {
            return spec.expand(&target.path.to_string_lossy());
        }
        let name = target
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.path.to_string_lossy().into_owned());
        let budget = config.duration_secs.unwrap_or(DEFAULT_FUZZ_SECONDS);
        (
            "cargo".to_string(),
            vec![
                "fuzz".into(),
                "run".into(),
                name,
                "--".into(),
                format!("-max_total_time={budget}"),
            ],
        )
    }

    /// Extract crash findings from libFuzzer/panic output.
    pub fn parse_output(target: &ScanTarget, combined: &str) -> Vec<RawFinding> {
        // Both the pre- and post-1.65 panic message layouts are in the wild.
        let panic_re =
            Regex::new(r"panicked at (?:'[^']*',\s*)?([^\s:]+):(\d+)(?::\d+)?").expect("static regex");
        let libfuzzer_re = Regex::new(r"ERROR: libFuzzer: ([a-zA-Z-]+)").expect("static regex");

        let mut findings = Vec::new();

        for caps in panic_re.captures_iter(combined) {
            let path = PathBuf::from(&caps[1]);
            let line: u32 = caps[2].parse().unwrap_or(0);
            findings.push(RawFinding {
                rule_id: "fuzz.panic".into(),
                severity: "crash".into(),
                path,
                start_line: line,
                end_line: line,
                message: format!(
                    "fuzzing `{}` triggered a panic at {}:{}",
                    target.path.display(),
                    &caps[1],
                    line
                ),
                remediation: Some("reproduce with the crash artifact under fuzz/artifacts".into()),
            });
        }

        for caps in libfuzzer_re.captures_iter(combined) {
            let kind = caps[1].to_ascii_lowercase();
            let severity = match kind.as_str() {
                "out-of-memory" => "oom",
                "timeout" => "timeout",
                _ => "crash",
            };
            findings.push(RawFinding {
                rule_id: format!("fuzz.{kind}"),
                severity: severity.into(),
                path: target.path.clone(),
                start_line: 0,
                end_line: 0,
                message: format!(
                    "libFuzzer reported {} while fuzzing `{}`",
                    kind,
                    target.path.display()
                ),
                remediation: Some("reproduce with the crash artifact under fuzz/artifacts".into()),
            });
        }

        findings
    }
}

#[async_trait]
impl ToolAdapter for FuzzAdapter {
    fn tool(&self) -> ToolKind {
        ToolKind::Fuzz
    }

    #[instrument(name = "fuzz_invoke", skip(self, config), fields(path = %target.path.display()))]
    async fn invoke(&self, target: &ScanTarget, config: &ToolConfig) -> Result<InvocationOutcome> {
        let timer = InvocationTimer::start(self.tool(), target);
        let (program, args) = Self::command(target, config);

        let output = match run_with_timeout(&program, &args, config.timeout()).await {
            CommandWait::Finished(output) => output,
            CommandWait::TimedOut => {
                return Ok(timer.finish(
                    InvocationStatus::Timeout,
                    clip_detail(&format!("exceeded {}s", config.timeout_secs)),
                    Vec::new(),
                ))
            }
            CommandWait::SpawnFailed(detail) => {
                return Ok(timer.finish(
                    InvocationStatus::ProcessFailure,
                    clip_detail(&detail),
                    Vec::new(),
                ))
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let findings = Self::parse_output(target, &combined);
        debug!(
            crashes = findings.len(),
            exit = output.status.code().unwrap_or(-1),
            "fuzz run finished"
        );

        // cargo-fuzz exits non-zero when a crash was found; that is still a
        // completed invocation. Non-zero with no crash signature means the
        // harness itself failed.
        if !output.status.success() && findings.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(timer.finish(
                InvocationStatus::ProcessFailure,
                clip_detail(&stderr),
                Vec::new(),
            ));
        }

        Ok(timer.finish(InvocationStatus::Completed, None, findings))
    }
}
