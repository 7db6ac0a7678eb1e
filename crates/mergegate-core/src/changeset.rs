use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::config::ConfigError;

/// What happened to a file within the change under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    #[serde(alias = "removed")]
    Deleted,
    Renamed,
}

/// One entry of a change-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(alias = "filename")]
    pub path: PathBuf,
    pub status: ChangeStatus,
    /// Unified-diff patch text for this file, when the descriptor carries it.
    #[serde(default)]
    pub patch: Option<String>,
}

/// Ordered sequence of file changes, immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn new(changes: Vec<FileChange>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Compute the change-set for a commit range by shelling out to git.
    ///
    /// An unreachable ref or failing git invocation is a configuration error;
    /// it aborts the run and is never retried.
    pub async fn from_commit_range(repo_dir: &Path, range: &str) -> Result<Self, ConfigError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_dir)
            .args(["diff", "--name-status", range])
            .output()
            .await
            .map_err(|err| ConfigError::UnresolvableRange {
                range: range.to_string(),
                detail: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConfigError::UnresolvableRange {
                range: range.to_string(),
                detail: stderr,
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let changeset = Self::parse_name_status(&text)?;
        debug!(range, files = changeset.len(), "computed change-set from git");
        Ok(changeset)
    }

    /// Parse `git diff --name-status` output.
    ///
    /// Lines look like `M\tpath`, `A\tpath`, `D\tpath` or `R100\told\tnew`;
    /// renames contribute their destination path.
    pub fn parse_name_status(text: &str) -> Result<Self, ConfigError> {
        let mut changes = Vec::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let code = fields.next().unwrap_or_default();
            let status = match code.chars().next() {
                Some('A') => ChangeStatus::Added,
                Some('M') => ChangeStatus::Modified,
                Some('D') => ChangeStatus::Deleted,
                Some('R') | Some('C') => ChangeStatus::Renamed,
                _ => {
                    return Err(ConfigError::InvalidDescriptor(format!(
                        "unrecognized git status `{code}` in line `{line}`"
                    )))
                }
            };
            let path = match status {
                // Rename/copy lines carry old and new paths; the new one is in scope.
                ChangeStatus::Renamed => fields.nth(1),
                _ => fields.next(),
            };
            let path = path.ok_or_else(|| {
                ConfigError::InvalidDescriptor(format!("missing path in line `{line}`"))
            })?;
            changes.push(FileChange {
                path: PathBuf::from(path),
                status,
                patch: None,
            });
        }
        Ok(Self::new(changes))
    }

    /// Parse a JSON change-set descriptor.
    ///
    /// The shape mirrors a code host's "changed files" payload:
    /// `[{"path": "src/lib.rs", "status": "modified"}, ...]`. The field
    /// aliases `filename` and `removed` are accepted for compatibility.
    pub fn from_descriptor_json(raw: &str) -> Result<Self, ConfigError> {
        let changes: Vec<FileChange> = serde_json::from_str(raw)
            .map_err(|err| ConfigError::InvalidDescriptor(err.to_string()))?;
        Ok(Self::new(changes))
    }

    /// Load a JSON change-set descriptor from disk.
    pub async fn from_descriptor_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ConfigError::DescriptorIo {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })?;
        Self::from_descriptor_json(&raw)
    }
}
