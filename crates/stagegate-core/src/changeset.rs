//! Candidate change sets: proposed file path -> content overrides.
//!
//! A [`CandidateChangeSet`] is produced once by a collaborator (the producer
//! response parser, or an API caller handing in edits) and consumed once by
//! the materializer. Paths are validated at construction time, not at
//! overlay time, so a traversal attempt never reaches the filesystem.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagegateError};

/// Filename token that marks a file as a test.
///
/// Kept for compatibility with the producer convention; routing decisions
/// read the explicit [`FileKind`] field, never this token directly.
pub const TEST_TOKEN: &str = "test_";

/// Whether a candidate file is production code or a test.
///
/// Carried as an explicit field on every entry so downstream stages never
/// re-infer it from the filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Code,
    Test,
}

impl FileKind {
    /// Default classification from the filename convention: a file whose
    /// name contains the `test_` token is a test, everything else is code.
    pub fn infer(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.contains(TEST_TOKEN) {
            FileKind::Test
        } else {
            FileKind::Code
        }
    }
}

/// One proposed file override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Path relative to the tree root, normalized.
    pub path: PathBuf,

    /// Full replacement content.
    pub content: String,

    /// Explicit test/code classification.
    pub kind: FileKind,
}

/// A set of proposed file mutations, keyed by normalized relative path.
///
/// Immutable once handed to the pipeline; an empty set is valid and means
/// "verify the current tree as-is".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateChangeSet {
    entries: Vec<ChangeEntry>,
}

impl CandidateChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a changeset from a plain `path -> content` map, inferring each
    /// entry's kind from the filename convention.
    pub fn from_map(files: BTreeMap<String, String>) -> Result<Self> {
        let mut set = Self::new();
        for (path, content) in files {
            let kind = FileKind::infer(Path::new(&path));
            set.insert(&path, content, kind)?;
        }
        Ok(set)
    }

    /// Add an entry, replacing any previous entry for the same path.
    ///
    /// Rejects absolute paths and any path that escapes the tree root after
    /// normalization.
    pub fn insert(&mut self, path: &str, content: String, kind: FileKind) -> Result<()> {
        let normalized = normalize_relative(path)?;
        self.entries.retain(|e| e.path != normalized);
        self.entries.push(ChangeEntry {
            path: normalized,
            content,
            kind,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries classified as tests.
    pub fn test_entries(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(|e| e.kind == FileKind::Test)
    }

    /// Entries classified as production code.
    pub fn code_entries(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(|e| e.kind == FileKind::Code)
    }
}

/// Normalize a candidate path and verify it stays inside the tree root.
///
/// `.` components are dropped, `..` components must never take the path
/// above the root at any point during traversal.
fn normalize_relative(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(StagegateError::InvalidPath(format!(
            "absolute path not allowed: {raw}"
        )));
    }

    let mut normalized = PathBuf::new();
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(StagegateError::InvalidPath(format!(
                        "path escapes tree root: {raw}"
                    )));
                }
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StagegateError::InvalidPath(format!(
                    "absolute path not allowed: {raw}"
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(StagegateError::InvalidPath(format!(
            "path resolves to the tree root itself: {raw}"
        )));
    }

    Ok(normalized)
}
