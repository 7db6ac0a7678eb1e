use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::{InvocationOutcome, ToolInvocation};
use crate::config::DedupConfig;
use crate::normalizer::{normalize, Finding, Severity};

/// Finalized collection of findings for one orchestration run.
///
/// Finding order is deterministic: descending severity, then path, then start
/// line, independent of invocation completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub findings: Vec<Finding>,
    pub invocations: Vec<ToolInvocation>,
}

impl RunReport {
    /// Invocations that did not complete; listed explicitly so a missing
    /// category of findings is never silent.
    pub fn failed_invocations(&self) -> Vec<&ToolInvocation> {
        self.invocations
            .iter()
            .filter(|inv| inv.status.is_failure())
            .collect()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Gate signal: 0 iff no finding reaches the threshold.
    pub fn exit_code(&self, threshold: Severity) -> i32 {
        if self.findings.iter().any(|f| f.severity >= threshold) {
            1
        } else {
            0
        }
    }
}

/// Failures that prevent producing a final report at all.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("run report was already finalized")]
    AlreadyFinalized,
}

/// Exclusive owner of `RunReport` construction.
///
/// Records invocation outcomes as they arrive, then finalizes exactly once;
/// results arriving after finalization are discarded and logged as anomalies.
pub struct Aggregator {
    dedup: DedupConfig,
    findings: Vec<Finding>,
    invocations: Vec<ToolInvocation>,
    finalized: bool,
}

impl Aggregator {
    pub fn new(dedup: DedupConfig) -> Self {
        Self {
            dedup,
            findings: Vec::new(),
            invocations: Vec::new(),
            finalized: false,
        }
    }

    /// Fold one invocation outcome into the report under construction.
    pub fn record(&mut self, outcome: InvocationOutcome) {
        if self.finalized {
            warn!(
                tool = %outcome.invocation.tool,
                path = %outcome.invocation.path.display(),
                "invocation result arrived after finalization; discarding"
            );
            return;
        }
        let tool = outcome.invocation.tool;
        for raw in &outcome.raw_findings {
            self.findings.push(normalize(tool, raw));
        }
        self.invocations.push(outcome.invocation);
    }

    /// Deduplicate, order, and seal the report. Callable exactly once.
    pub fn finalize(&mut self) -> Result<RunReport, AggregationError> {
        if self.finalized {
            return Err(AggregationError::AlreadyFinalized);
        }
        self.finalized = true;

        let raw_count = self.findings.len();
        let mut findings = dedupe(std::mem::take(&mut self.findings), &self.dedup);
        findings.sort_by(|a, b| {
            Reverse(a.severity)
                .cmp(&Reverse(b.severity))
                .then_with(|| a.location.path.cmp(&b.location.path))
                .then_with(|| a.location.start_line.cmp(&b.location.start_line))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        let mut invocations = std::mem::take(&mut self.invocations);
        invocations.sort_by(|a, b| (a.tool, &a.path).cmp(&(b.tool, &b.path)));

        debug!(
            raw = raw_count,
            unique = findings.len(),
            "finalized run report"
        );
        Ok(RunReport {
            findings,
            invocations,
        })
    }
}

/// Merge duplicate findings.
///
/// Two findings are duplicates when they share a file, their line ranges
/// overlap, and their normalized messages reach the similarity threshold. The
/// merge keeps the representative's location and message, takes the highest
/// severity, and records every contributing tool. The operation is
/// idempotent.
pub fn dedupe(findings: Vec<Finding>, config: &DedupConfig) -> Vec<Finding> {
    let mut unique: Vec<Finding> = Vec::with_capacity(findings.len());
    for candidate in findings {
        match unique
            .iter_mut()
            .find(|existing| is_duplicate(existing, &candidate, config.similarity_threshold))
        {
            Some(existing) => merge_into(existing, candidate),
            None => unique.push(candidate),
        }
    }
    unique
}

fn is_duplicate(a: &Finding, b: &Finding, threshold: f32) -> bool {
    if a.location.path != b.location.path {
        return false;
    }
    let overlap = a.location.start_line <= b.location.end_line
        && b.location.start_line <= a.location.end_line;
    if !overlap {
        return false;
    }
    jaccard(&message_tokens(&a.message), &message_tokens(&b.message)) >= threshold
}

fn merge_into(existing: &mut Finding, candidate: Finding) {
    if candidate.severity > existing.severity {
        existing.severity = candidate.severity;
        existing.rule_id = candidate.rule_id;
        if candidate.remediation.is_some() {
            existing.remediation = candidate.remediation;
        }
    } else if existing.remediation.is_none() {
        existing.remediation = candidate.remediation;
    }
    existing.needs_triage |= candidate.needs_triage;
    let mut tools: BTreeSet<_> = existing.tools.iter().copied().collect();
    tools.extend(candidate.tools);
    existing.tools = tools.into_iter().collect();
}

fn message_tokens(message: &str) -> BTreeSet<String> {
    message
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}
