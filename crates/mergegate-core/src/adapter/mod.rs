use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{ToolConfig, ToolKind};
use crate::resolver::ScanTarget;

pub mod fuzz;
pub mod llm;
pub mod semgrep;

pub use fuzz::FuzzAdapter;
pub use llm::{LlmReviewAdapter, LlmSettings};
pub use semgrep::SemgrepAdapter;

/// Terminal state of one tool invocation.
///
/// Invocation-level failures are isolated: they degrade that tool's
/// contribution to the report, never the sibling invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Completed,
    Timeout,
    Unparseable,
    ProcessFailure,
    TransientFailure,
    Cancelled,
}

impl InvocationStatus {
    /// Only transient classes (rate limit, network timeout) earn retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, InvocationStatus::TransientFailure)
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, InvocationStatus::Completed)
    }
}

/// Record of one external tool run against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: ToolKind,
    pub path: PathBuf,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub status: InvocationStatus,
    /// Short diagnostic (stderr excerpt, parse error) for failed invocations.
    #[serde(default)]
    pub detail: Option<String>,
}

impl ToolInvocation {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.finished_at_ms.saturating_sub(self.started_at_ms))
    }
}

/// Tool-native finding before normalization. `severity` keeps the tool's own
/// label; the normalizer maps it onto the shared scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFinding {
    pub rule_id: String,
    pub severity: String,
    pub path: PathBuf,
    pub start_line: u32,
    pub end_line: u32,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

/// Invocation record plus whatever findings the tool produced.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub invocation: ToolInvocation,
    pub raw_findings: Vec<RawFinding>,
}

/// Captures start time so adapters can close out an invocation uniformly.
pub struct InvocationTimer {
    tool: ToolKind,
    path: PathBuf,
    started_at_ms: u64,
}

impl InvocationTimer {
    pub fn start(tool: ToolKind, target: &ScanTarget) -> Self {
        Self {
            tool,
            path: target.path.clone(),
            started_at_ms: now_ms(),
        }
    }

    pub fn finish(
        self,
        status: InvocationStatus,
        detail: Option<String>,
        raw_findings: Vec<RawFinding>,
    ) -> InvocationOutcome {
        InvocationOutcome {
            invocation: ToolInvocation {
                tool: self.tool,
                path: self.path,
                started_at_ms: self.started_at_ms,
                finished_at_ms: now_ms(),
                status,
                detail,
            },
            raw_findings,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Uniform interface every external analyzer sits behind.
///
/// `invoke` blocks until the tool terminates or its timeout elapses; it maps
/// tool-side failures into `InvocationStatus`, reserving `Err` for internal
/// faults. On timeout the underlying process is terminated, never left to
/// hang the scheduler.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn tool(&self) -> ToolKind;

    async fn invoke(&self, target: &ScanTarget, config: &ToolConfig) -> Result<InvocationOutcome>;
}

/// Result of waiting on a child process with a deadline.
pub(crate) enum CommandWait {
    Finished(std::process::Output),
    TimedOut,
    SpawnFailed(String),
}

/// Run an external command, killing it if the deadline elapses.
pub(crate) async fn run_with_timeout(
    program: &str,
    args: &[String],
    deadline: Duration,
) -> CommandWait {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        // Dropping the wait future (timeout or cancellation) must not leave
        // the child running.
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return CommandWait::SpawnFailed(err.to_string()),
    };

    match timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandWait::Finished(output),
        Ok(Err(err)) => CommandWait::SpawnFailed(err.to_string()),
        Err(_elapsed) => CommandWait::TimedOut,
    }
}

/// Clip a diagnostic string to a reasonable size for the report.
pub(crate) fn clip_detail(text: &str) -> Option<String> {
    const MAX_DETAIL_CHARS: usize = 400;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_DETAIL_CHARS).collect())
}
