use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::changeset::{ChangeSet, ChangeStatus};
use crate::config::{RunConfig, ToolKind};

/// A unit of work pairing one analysis tool with one file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanTarget {
    pub tool: ToolKind,
    pub path: PathBuf,
    /// Patch text from the change-set descriptor; adapters that review
    /// content prefer it over reading the whole file.
    #[serde(default)]
    pub patch: Option<String>,
}

/// Derive scan targets from a change-set and the static language-to-tool map.
///
/// Every file with a recognized extension yields exactly one target per
/// applicable enabled tool; deleted files and unrecognized extensions are
/// skipped, not errors. An explicit manual target list takes precedence over
/// the change-set-derived files. Output order is deterministic.
pub fn resolve(changeset: &ChangeSet, config: &RunConfig) -> Vec<ScanTarget> {
    let files: Vec<(PathBuf, Option<String>)> = match config
        .overrides
        .as_ref()
        .and_then(|o| o.targets.as_ref())
    {
        Some(explicit) => explicit.iter().map(|path| (path.clone(), None)).collect(),
        None => changeset
            .changes()
            .iter()
            .filter(|change| change.status != ChangeStatus::Deleted)
            .map(|change| (change.path.clone(), change.patch.clone()))
            .collect(),
    };

    let mut targets = BTreeSet::new();
    for tool in config.enabled_tools() {
        let extensions = config.extensions_for(tool);
        for (path, patch) in &files {
            if applies(path, &extensions) {
                targets.insert(ScanTarget {
                    tool,
                    path: path.clone(),
                    patch: patch.clone(),
                });
            }
        }
    }

    debug!(
        files = files.len(),
        targets = targets.len(),
        "resolved scan targets"
    );
    targets.into_iter().collect()
}

fn applies(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions.iter().any(|known| known.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileChange;
    use crate::config::ManualOverrides;

    fn changeset(entries: &[(&str, ChangeStatus)]) -> ChangeSet {
        ChangeSet::new(
            entries
                .iter()
                .map(|(path, status)| FileChange {
                    path: PathBuf::from(path),
                    status: *status,
                    patch: None,
                })
                .collect(),
        )
    }

    fn semgrep_only(extensions: &[&str]) -> RunConfig {
        let mut config = RunConfig::default();
        config
            .tools
            .get_mut(&ToolKind::Semgrep)
            .unwrap()
            .extensions = extensions.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn one_target_per_applicable_tool_per_file() {
        let mut config = semgrep_only(&["move", "rs"]);
        config.tools.get_mut(&ToolKind::Fuzz).unwrap().enabled = true;
        let changeset = changeset(&[
            ("a.move", ChangeStatus::Modified),
            ("src/lib.rs", ChangeStatus::Added),
            ("README.md", ChangeStatus::Modified),
        ]);

        let targets = resolve(&changeset, &config);
        // semgrep applies to both recognized files, fuzz only to the .rs one.
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&ScanTarget {
            tool: ToolKind::Semgrep,
            path: PathBuf::from("a.move"),
            patch: None,
        }));
        assert!(targets.contains(&ScanTarget {
            tool: ToolKind::Semgrep,
            path: PathBuf::from("src/lib.rs"),
            patch: None,
        }));
        assert!(targets.contains(&ScanTarget {
            tool: ToolKind::Fuzz,
            path: PathBuf::from("src/lib.rs"),
            patch: None,
        }));
    }

    #[test]
    fn duplicate_changeset_entries_collapse() {
        let config = semgrep_only(&["rs"]);
        let changeset = changeset(&[
            ("src/lib.rs", ChangeStatus::Modified),
            ("src/lib.rs", ChangeStatus::Modified),
        ]);
        assert_eq!(resolve(&changeset, &config).len(), 1);
    }

    #[test]
    fn deleted_files_are_skipped() {
        let config = semgrep_only(&["rs"]);
        let changeset = changeset(&[("src/gone.rs", ChangeStatus::Deleted)]);
        assert!(resolve(&changeset, &config).is_empty());
    }

    #[test]
    fn unrecognized_extensions_are_skipped_silently() {
        let config = semgrep_only(&["rs"]);
        let changeset = changeset(&[
            ("notes.txt", ChangeStatus::Modified),
            ("Makefile", ChangeStatus::Modified),
        ]);
        assert!(resolve(&changeset, &config).is_empty());
    }

    #[test]
    fn disabled_tools_contribute_no_targets() {
        let mut config = semgrep_only(&["rs"]);
        config.tools.get_mut(&ToolKind::Semgrep).unwrap().enabled = false;
        let changeset = changeset(&[("src/lib.rs", ChangeStatus::Modified)]);
        assert!(resolve(&changeset, &config).is_empty());
    }

    #[test]
    fn manual_target_list_replaces_changeset_files() {
        let mut config = semgrep_only(&["rs"]);
        config.overrides = Some(ManualOverrides {
            duration_secs: None,
            targets: Some(vec![PathBuf::from("src/chosen.rs")]),
        });
        let changeset = changeset(&[("src/other.rs", ChangeStatus::Modified)]);
        let targets = resolve(&changeset, &config);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, PathBuf::from("src/chosen.rs"));
    }

    #[test]
    fn output_order_is_deterministic() {
        let config = semgrep_only(&["rs"]);
        let forward = changeset(&[
            ("b.rs", ChangeStatus::Modified),
            ("a.rs", ChangeStatus::Modified),
        ]);
        let reverse = changeset(&[
            ("a.rs", ChangeStatus::Modified),
            ("b.rs", ChangeStatus::Modified),
        ]);
        assert_eq!(resolve(&forward, &config), resolve(&reverse, &config));
    }

    #[test]
    fn descriptor_patch_text_reaches_the_target() {
        let config = semgrep_only(&["rs"]);
        let changeset = ChangeSet::new(vec![FileChange {
            path: PathBuf::from("src/lib.rs"),
            status: ChangeStatus::Modified,
            patch: Some("@@ -1 +1 @@\n-a\n+b".into()),
        }]);
        let targets = resolve(&changeset, &config);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].patch.as_deref(), Some("@@ -1 +1 @@\n-a\n+b"));
    }

    #[test]
    fn manual_targets_carry_no_patch_text() {
        let mut config = semgrep_only(&["rs"]);
        config.overrides = Some(ManualOverrides {
            duration_secs: None,
            targets: Some(vec![PathBuf::from("src/chosen.rs")]),
        });
        let changeset = ChangeSet::new(vec![FileChange {
            path: PathBuf::from("src/chosen.rs"),
            status: ChangeStatus::Modified,
            patch: Some("@@ ignored @@".into()),
        }]);
        let targets = resolve(&changeset, &config);
        assert_eq!(targets.len(), 1);
        assert!(targets[0].patch.is_none());
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let config = semgrep_only(&["rs"]);
        let changeset = changeset(&[("WEIRD.RS", ChangeStatus::Modified)]);
        assert_eq!(resolve(&changeset, &config).len(), 1);
    }
}
