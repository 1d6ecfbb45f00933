//! Workspace materializer: isolated copies of the tree with a changeset
//! overlaid.
//!
//! Two modes:
//! - full-tree: copy the source tree minus exclusion globs, then overlay,
//! - scratch: a bare directory holding only the changeset files (generation
//!   sandbox).
//!
//! Workspaces are uniquely named per invocation and retained on disk for
//! audit and packaging. A copy or overlay failure aborts materialization;
//! the partially written directory is never handed onward.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::changeset::CandidateChangeSet;
use crate::error::{Result, StagegateError};

/// Exclusion globs with the reason each pattern is excluded.
///
/// Patterns match the path relative to the copy root, and also individual
/// path components, so `__pycache__` excludes the directory wherever it
/// appears.
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    set: GlobSet,
    pairs: Vec<(String, String)>,
}

impl ExcludeRules {
    /// Compile `(pattern, reason)` pairs into a rule set.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for (pattern, _) in pairs {
            let glob = Glob::new(pattern).map_err(|e| {
                StagegateError::InvalidConfig(format!("bad exclude glob {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| StagegateError::InvalidConfig(format!("exclude globs: {e}")))?;
        Ok(Self {
            set,
            pairs: pairs
                .iter()
                .map(|(p, r)| (p.to_string(), r.to_string()))
                .collect(),
        })
    }

    /// Default exclusions for a deployable service tree.
    pub fn defaults() -> Result<Self> {
        Self::from_pairs(&[
            ("*.pyc", "build artifact"),
            ("__pycache__", "build artifact"),
            ("target", "build artifact"),
            (".git", "not part of deployable state"),
            ("self_updates", "avoid recursive staging/package copies"),
            ("node_modules", "dependency cache"),
        ])
    }

    /// Whether a path relative to the copy root is excluded.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        if self.set.is_match(rel) {
            return true;
        }
        rel.components()
            .any(|c| self.set.is_match(Path::new(c.as_os_str())))
    }

    /// The configured `(pattern, reason)` pairs.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

/// An isolated on-disk copy used to trial a changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique workspace identity (directory name).
    pub id: String,

    /// Absolute path to the workspace root.
    pub root: PathBuf,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Produces isolated workspaces with candidate contents overlaid.
#[derive(Debug, Clone)]
pub struct Materializer {
    staging_root: PathBuf,
    excludes: ExcludeRules,
}

impl Materializer {
    pub fn new(staging_root: impl Into<PathBuf>, excludes: ExcludeRules) -> Self {
        Self {
            staging_root: staging_root.into(),
            excludes,
        }
    }

    /// Copy the whole source tree (minus exclusions) and overlay the
    /// changeset. An empty changeset yields a verbatim copy, which lets the
    /// pipeline validate current state in isolation.
    pub fn materialize_full(
        &self,
        source_root: &Path,
        changeset: &CandidateChangeSet,
    ) -> Result<Workspace> {
        let workspace = self.fresh_workspace("staging")?;
        self.copy_tree(source_root, &workspace.root)?;
        overlay(&workspace.root, changeset)?;
        info!(
            workspace = %workspace.root.display(),
            files_overlaid = changeset.len(),
            "materialized full-tree workspace"
        );
        Ok(workspace)
    }

    /// Materialize only the changeset files into a fresh scratch directory.
    pub fn materialize_scratch(&self, changeset: &CandidateChangeSet) -> Result<Workspace> {
        let workspace = self.fresh_workspace("scratch")?;
        overlay(&workspace.root, changeset)?;
        info!(
            workspace = %workspace.root.display(),
            files = changeset.len(),
            "materialized scratch workspace"
        );
        Ok(workspace)
    }

    /// Allocate a uniquely named workspace directory.
    ///
    /// The timestamp keeps names sortable; the random suffix keeps
    /// concurrent invocations within the same second from colliding.
    fn fresh_workspace(&self, prefix: &str) -> Result<Workspace> {
        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{prefix}_{}_{}",
            created_at.format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        );
        let root = self.staging_root.join(&id);
        std::fs::create_dir_all(&root)?;
        Ok(Workspace {
            id,
            root,
            created_at,
        })
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<()> {
        for entry in WalkDir::new(source).min_depth(1).into_iter().filter_entry(|e| {
            e.path()
                .strip_prefix(source)
                .map(|rel| !self.excludes.is_excluded(rel))
                .unwrap_or(true)
        }) {
            let entry =
                entry.map_err(|e| StagegateError::Staging(format!("walking source tree: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| StagegateError::Staging(format!("path outside source tree: {e}")))?;
            let target = dest.join(rel);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target).map_err(|e| {
                    StagegateError::Staging(format!(
                        "copying {} failed: {e}",
                        entry.path().display()
                    ))
                })?;
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular file");
            }
        }
        Ok(())
    }
}

/// Write each changeset entry into the workspace, creating parents and
/// overwriting existing files.
fn overlay(root: &Path, changeset: &CandidateChangeSet) -> Result<()> {
    for entry in changeset.entries() {
        let target = root.join(&entry.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &entry.content).map_err(|e| {
            StagegateError::Staging(format!("overlaying {} failed: {e}", target.display()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileKind;

    fn materializer(staging: &Path) -> Materializer {
        Materializer::new(staging, ExcludeRules::defaults().unwrap())
    }

    fn seed_tree(root: &Path) {
        std::fs::create_dir_all(root.join("backend/api")).unwrap();
        std::fs::create_dir_all(root.join("__pycache__")).unwrap();
        std::fs::create_dir_all(root.join("self_updates/staging/old")).unwrap();
        std::fs::write(root.join("backend/main.py"), "print('main')").unwrap();
        std::fs::write(root.join("backend/api/routes.py"), "routes").unwrap();
        std::fs::write(root.join("__pycache__/junk.pyc"), "junk").unwrap();
        std::fs::write(root.join("self_updates/staging/old/left.py"), "old").unwrap();
    }

    #[test]
    fn test_full_copy_preserves_unchanged_content() {
        let source = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        seed_tree(source.path());

        let ws = materializer(staging.path())
            .materialize_full(source.path(), &CandidateChangeSet::new())
            .unwrap();

        let copied = std::fs::read_to_string(ws.root.join("backend/main.py")).unwrap();
        assert_eq!(copied, "print('main')");
        assert!(ws.root.join("backend/api/routes.py").is_file());
    }

    #[test]
    fn test_exclusions_are_not_copied() {
        let source = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        seed_tree(source.path());

        let ws = materializer(staging.path())
            .materialize_full(source.path(), &CandidateChangeSet::new())
            .unwrap();

        assert!(!ws.root.join("__pycache__").exists());
        assert!(!ws.root.join("self_updates").exists());
    }

    #[test]
    fn test_overlay_content_is_byte_exact() {
        let source = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        seed_tree(source.path());

        let mut changes = CandidateChangeSet::new();
        changes
            .insert("backend/main.py", "print('v2')\n".into(), FileKind::Code)
            .unwrap();
        changes
            .insert("backend/new/feature.py", "feature".into(), FileKind::Code)
            .unwrap();

        let ws = materializer(staging.path())
            .materialize_full(source.path(), &changes)
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(ws.root.join("backend/main.py")).unwrap(),
            "print('v2')\n"
        );
        // Parent directories are created for new paths.
        assert_eq!(
            std::fs::read_to_string(ws.root.join("backend/new/feature.py")).unwrap(),
            "feature"
        );
        // Untouched files match the source.
        assert_eq!(
            std::fs::read_to_string(ws.root.join("backend/api/routes.py")).unwrap(),
            "routes"
        );
    }

    #[test]
    fn test_scratch_holds_only_changeset_files() {
        let staging = tempfile::tempdir().unwrap();
        let mut changes = CandidateChangeSet::new();
        changes
            .insert("test_feature.py", "assert True".into(), FileKind::Test)
            .unwrap();

        let ws = materializer(staging.path())
            .materialize_scratch(&changes)
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(&ws.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["test_feature.py"]);
    }

    #[test]
    fn test_workspace_ids_are_unique() {
        let source = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        seed_tree(source.path());
        let m = materializer(staging.path());

        let a = m
            .materialize_full(source.path(), &CandidateChangeSet::new())
            .unwrap();
        let b = m
            .materialize_full(source.path(), &CandidateChangeSet::new())
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.root, b.root);
    }

    #[test]
    fn test_exclude_rules_match_components() {
        let rules = ExcludeRules::defaults().unwrap();
        assert!(rules.is_excluded(Path::new("backend/__pycache__/x.pyc")));
        assert!(rules.is_excluded(Path::new("self_updates/staging/ws1/a.py")));
        assert!(!rules.is_excluded(Path::new("backend/main.py")));
    }
}
