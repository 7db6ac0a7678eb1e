use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{
    clip_detail, run_with_timeout, CommandWait, InvocationOutcome, InvocationStatus,
    InvocationTimer, RawFinding, ToolAdapter,
};
use crate::config::{CommandSpec, ToolConfig, ToolKind};
use crate::resolver::ScanTarget;

/// Adapter driving the semgrep binary in JSON output mode.
///
/// Semgrep is deterministic, so it never earns retries; any failure class is
/// final for the invocation.
#[derive(Debug, Default)]
pub struct SemgrepAdapter;

impl SemgrepAdapter {
    pub fn new() -> Self {
        Self
    }

    fn command(config: &ToolConfig) -> CommandSpec {
        config.command.clone().unwrap_or_else(|| CommandSpec {
            program: "semgrep".into(),
            args: vec![
                "scan".into(),
                "--json".into(),
                "--quiet".into(),
                "--config".into(),
                "auto".into(),
            ],
        })
    }

    /// Parse semgrep's native JSON results into raw findings.
    pub fn parse_output(raw: &str) -> Result<Vec<RawFinding>, String> {
        let parsed: SemgrepOutput =
            serde_json::from_str(raw).map_err(|err| format!("invalid semgrep JSON: {err}"))?;
        Ok(parsed
            .results
            .into_iter()
            .map(|result| RawFinding {
                rule_id: result.check_id,
                severity: result.extra.severity,
                path: PathBuf::from(result.path),
                start_line: result.start.line,
                end_line: result.end.line,
                message: result.extra.message,
                remediation: result.extra.fix,
            })
            .collect())
    }
}

#[async_trait]
impl ToolAdapter for SemgrepAdapter {
    fn tool(&self) -> ToolKind {
        ToolKind::Semgrep
    }

    #[instrument(name = "semgrep_invoke", skip(self, config), fields(path = %target.path.display()))]
    async fn invoke(&self, target: &ScanTarget, config: &ToolConfig) -> Result<InvocationOutcome> {
        let timer = InvocationTimer::start(self.tool(), target);
        let spec = Self::command(config);
        let (program, args) = spec.expand(&target.path.to_string_lossy());

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

        // Semgrep exits 1 when findings exist; anything beyond that is a
        // genuine process failure.
        let exit = output.status.code().unwrap_or(-1);
        if exit != 0 && exit != 1 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(timer.finish(
                InvocationStatus::ProcessFailure,
                clip_detail(&stderr),
                Vec::new(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match Self::parse_output(&stdout) {
            Ok(findings) => {
                debug!(count = findings.len(), "semgrep scan finished");
                Ok(timer.finish(InvocationStatus::Completed, None, findings))
            }
            Err(detail) => Ok(timer.finish(
                InvocationStatus::Unparseable,
                clip_detail(&detail),
                Vec::new(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct SemgrepOutput {
    #[serde(default)]
    results: Vec<SemgrepResult>,
}

#[derive(Deserialize)]
struct SemgrepResult {
    check_id: String,
    path: String,
    start: SemgrepPosition,
    end: SemgrepPosition,
    extra: SemgrepExtra,
}

#[derive(Deserialize)]
struct SemgrepPosition {
    line: u32,
}

#[derive(Deserialize)]
struct SemgrepExtra {
    message: String,
    severity: String,
    #[serde(default)]
    fix: Option<String>,
}
