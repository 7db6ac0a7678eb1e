use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalizer::Severity;

/// Identity of an analysis tool the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Semgrep,
    Fuzz,
    Llm,
}

impl ToolKind {
    pub fn all() -> [ToolKind; 3] {
        [ToolKind::Semgrep, ToolKind::Fuzz, ToolKind::Llm]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Semgrep => "semgrep",
            ToolKind::Fuzz => "fuzz",
            ToolKind::Llm => "llm",
        }
    }

    /// Deterministic tools never earn retries; only network-backed ones do.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, ToolKind::Llm)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External command override, mainly so tests can substitute a stub binary.
///
/// Occurrences of `{path}` in `args` are replaced with the target path; when
/// no placeholder is present the path is appended as the final argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Expand into (program, argv) for a concrete target path.
    pub fn expand(&self, path: &str) -> (String, Vec<String>) {
        let mut args: Vec<String> = Vec::with_capacity(self.args.len() + 1);
        let mut substituted = false;
        for arg in &self.args {
            if arg.contains("{path}") {
                substituted = true;
                args.push(arg.replace("{path}", path));
            } else {
                args.push(arg.clone());
            }
        }
        if !substituted {
            args.push(path.to_string());
        }
        (self.program.clone(), args)
    }
}

/// Per-tool policy: applicability, timeout, retry budget, command override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries on transient failures only; deterministic tools keep this at 0.
    #[serde(default)]
    pub max_retries: u32,
    /// File extensions this tool applies to; empty means "use built-in defaults".
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    /// Free-form text appended to the LLM reviewer instructions.
    #[serde(default)]
    pub extra_instructions: Option<String>,
    /// Wall-clock budget handed to time-bounded tools (fuzzing).
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            extensions: Vec::new(),
            command: None,
            extra_instructions: None,
            duration_secs: None,
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

/// Built-in extension applicability when a tool config leaves it unset.
pub fn default_extensions(tool: ToolKind) -> &'static [&'static str] {
    match tool {
        ToolKind::Semgrep => &[
            "rs", "move", "sol", "py", "go", "js", "ts", "java", "c", "cpp",
        ],
        ToolKind::Fuzz => &["rs"],
        ToolKind::Llm => &[
            "rs", "move", "sol", "py", "go", "js", "ts", "java", "c", "cpp",
        ],
    }
}

/// Thresholds steering duplicate detection in the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Token-level Jaccard similarity two messages must reach to merge.
    pub similarity_threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
        }
    }
}

/// Manual-trigger parameters merged over defaults at run start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualOverrides {
    /// Explicit budget for time-bounded tools, in seconds.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Explicit target list replacing the change-set-derived file list.
    #[serde(default)]
    pub targets: Option<Vec<PathBuf>>,
}

impl ManualOverrides {
    pub fn is_empty(&self) -> bool {
        self.duration_secs.is_none() && self.targets.is_none()
    }
}

/// Top-level run configuration for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Bounded degree of parallelism for the invocation pool.
    pub max_parallel: usize,
    /// Findings at or above this severity make the run exit non-zero.
    pub fail_on: Severity,
    pub dedup: DedupConfig,
    pub tools: BTreeMap<ToolKind, ToolConfig>,
    pub overrides: Option<ManualOverrides>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            fail_on: Severity::Medium,
            dedup: DedupConfig::default(),
            tools: default_tools(),
            overrides: None,
        }
    }
}

fn default_tools() -> BTreeMap<ToolKind, ToolConfig> {
    let mut tools = BTreeMap::new();
    tools.insert(ToolKind::Semgrep, ToolConfig::default());
    tools.insert(
        ToolKind::Fuzz,
        ToolConfig {
            enabled: false,
            duration_secs: Some(60),
            ..ToolConfig::default()
        },
    );
    tools.insert(
        ToolKind::Llm,
        ToolConfig {
            enabled: false,
            timeout_secs: 120,
            max_retries: 2,
            ..ToolConfig::default()
        },
    );
    tools
}

impl RunConfig {
    pub fn tool(&self, kind: ToolKind) -> Option<&ToolConfig> {
        self.tools.get(&kind)
    }

    /// Tools that are configured and switched on, in stable order.
    pub fn enabled_tools(&self) -> Vec<ToolKind> {
        self.tools
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Effective extension list for a tool, falling back to built-in defaults.
    pub fn extensions_for(&self, kind: ToolKind) -> Vec<String> {
        match self.tool(kind) {
            Some(cfg) if !cfg.extensions.is_empty() => cfg.extensions.clone(),
            _ => default_extensions(kind)
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Merge manual-trigger parameters over the configured defaults.
    pub fn apply_overrides(&mut self, overrides: ManualOverrides) {
        if overrides.is_empty() {
            return;
        }
        if let Some(duration) = overrides.duration_secs {
            if let Some(fuzz) = self.tools.get_mut(&ToolKind::Fuzz) {
                fuzz.duration_secs = Some(duration);
                // The invocation timeout must outlast the fuzzing budget.
                fuzz.timeout_secs = fuzz.timeout_secs.max(duration + 30);
            }
        }
        let merged = match self.overrides.take() {
            Some(existing) => ManualOverrides {
                duration_secs: overrides.duration_secs.or(existing.duration_secs),
                targets: overrides.targets.or(existing.targets),
            },
            None => overrides,
        };
        self.overrides = Some(merged);
    }

    /// Validate invariants before any invocation starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(ConfigError::InvalidSimilarity {
                threshold: self.dedup.similarity_threshold,
            });
        }
        let enabled = self.enabled_tools();
        if enabled.is_empty() {
            return Err(ConfigError::NoToolsEnabled);
        }
        for kind in enabled {
            let cfg = self.tools.get(&kind).expect("enabled tool must exist");
            if cfg.timeout_secs == 0 {
                return Err(ConfigError::ZeroTimeout { tool: kind });
            }
        }
        Ok(())
    }
}

/// Fatal configuration problems; these abort the run before any invocation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("change-set for `{range}` could not be computed: {detail}")]
    UnresolvableRange { range: String, detail: String },
    #[error("failed to read change-set descriptor at {path}: {detail}")]
    DescriptorIo { path: PathBuf, detail: String },
    #[error("invalid change-set descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("max_parallel must be greater than zero")]
    ZeroParallelism,
    #[error("dedup similarity threshold must be within 0.0..=1.0 (got {threshold})")]
    InvalidSimilarity { threshold: f32 },
    #[error("tool `{tool}` timeout must be greater than zero")]
    ZeroTimeout { tool: ToolKind },
    #[error("no tools are enabled")]
    NoToolsEnabled,
}
