//! Git-backed backup recorder: recovery points before any mutation.
//!
//! The recorder shells out to `git` and parses only exit codes plus, for
//! snapshots, the short revision id. It never interprets repository
//! internals beyond that. Rollback is destructive and is exposed as an
//! operator command — the pipeline itself only reports the rollback plan
//! as data.

use std::path::PathBuf;
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StagegateError};

/// Opaque recovery-point identifier (short revision id).
///
/// Used only for display and for constructing the rollback command; the
/// pipeline never parses its internal structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle(pub String);

impl BackupHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a snapshot attempt. Command failures surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SnapshotOutcome {
    /// A new recovery point was committed.
    Created { handle: BackupHandle },

    /// Nothing changed since the last snapshot; the previous recovery point
    /// still stands. Not an error.
    NoChanges,
}

/// The rollback procedure, reported as data alongside blocked outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Recovery point the plan restores past, when one was created.
    pub handle: Option<BackupHandle>,

    /// Operator command restoring the previous state.
    pub command: String,

    /// Recent history for context, one line per commit.
    pub recent_history: Option<String>,
}

/// Snapshots the current tree state and restores it on operator request.
#[derive(Debug, Clone)]
pub struct BackupRecorder {
    repo_dir: PathBuf,
}

impl BackupRecorder {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    /// Commit the current tree state as a recovery point.
    ///
    /// Bootstraps a repository transparently if none exists: the first
    /// snapshot becomes the initial baseline. Calling again with no
    /// intervening changes reports [`SnapshotOutcome::NoChanges`].
    pub fn snapshot(&self, message: &str) -> Result<SnapshotOutcome> {
        if !self.is_repo() {
            self.git(&["init"])?;
            info!(repo = %self.repo_dir.display(), "initialized git repository for backups");
        }

        self.git(&["add", "-A"])?;

        let status = self.git(&["status", "--porcelain"])?;
        let nothing_staged = String::from_utf8_lossy(&status.stdout).trim().is_empty();
        if nothing_staged {
            if self.has_commits() {
                return Ok(SnapshotOutcome::NoChanges);
            }
            // Empty tree on a fresh repository: establish the baseline anyway.
            self.git(&["commit", "--allow-empty", "-m", message])?;
        } else {
            self.git(&["commit", "-m", message])?;
        }
        let rev = self.git(&["rev-parse", "--short", "HEAD"])?;
        let handle = BackupHandle(String::from_utf8_lossy(&rev.stdout).trim().to_string());
        if handle.as_str().is_empty() {
            return Err(StagegateError::Git(
                "git rev-parse returned empty revision id".to_string(),
            ));
        }

        info!(handle = %handle, "backup snapshot created");
        Ok(SnapshotOutcome::Created { handle })
    }

    /// Restore the tree to the state `steps` snapshots back.
    ///
    /// Destructive to uncommitted work. This is an operator action; the
    /// pipeline never calls it.
    pub fn rollback(&self, steps: u32) -> Result<()> {
        let target = format!("HEAD~{steps}");
        self.git(&["reset", "--hard", &target])?;
        info!(steps, "rolled back to previous snapshot");
        Ok(())
    }

    /// Recent commit history, one line per commit.
    pub fn recent_history(&self) -> Result<String> {
        let out = self.git(&["log", "--oneline", "-5"])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// The rollback procedure for the given recovery point, as data.
    pub fn rollback_plan(&self, handle: Option<&BackupHandle>) -> RollbackPlan {
        RollbackPlan {
            handle: handle.cloned(),
            command: "git reset --hard HEAD~1".to_string(),
            recent_history: self.recent_history().ok(),
        }
    }

    fn is_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&self.repo_dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn has_commits(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "HEAD"])
            .current_dir(&self.repo_dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run a git command, surfacing any failure verbatim.
    fn git(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|e| StagegateError::Git(format!("failed to run git {args:?}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(StagegateError::Git(format!(
                "git {args:?} failed: {stderr}{stdout}"
            )));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn configured_recorder(dir: &Path) -> BackupRecorder {
        let recorder = BackupRecorder::new(dir);
        // Bootstrap happens inside snapshot(); identity must exist first.
        std::process::Command::new("git")
            .args(["init"])
            .current_dir(dir)
            .output()
            .unwrap();
        for (key, value) in [("user.name", "test-user"), ("user.email", "test@example.com")] {
            std::process::Command::new("git")
                .args(["config", key, value])
                .current_dir(dir)
                .output()
                .unwrap();
        }
        recorder
    }

    #[test]
    fn test_snapshot_bootstraps_and_creates_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let recorder = configured_recorder(dir.path());

        let outcome = recorder.snapshot("baseline").unwrap();
        match outcome {
            SnapshotOutcome::Created { handle } => assert!(!handle.as_str().is_empty()),
            SnapshotOutcome::NoChanges => panic!("first snapshot must create a commit"),
        }
    }

    #[test]
    fn test_second_snapshot_without_changes_is_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let recorder = configured_recorder(dir.path());

        recorder.snapshot("baseline").unwrap();
        let outcome = recorder.snapshot("again").unwrap();
        assert_eq!(outcome, SnapshotOutcome::NoChanges);
    }

    #[test]
    fn test_snapshot_after_change_creates_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let recorder = configured_recorder(dir.path());

        let first = recorder.snapshot("baseline").unwrap();
        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        let second = recorder.snapshot("edit").unwrap();

        match (first, second) {
            (
                SnapshotOutcome::Created { handle: h1 },
                SnapshotOutcome::Created { handle: h2 },
            ) => assert_ne!(h1, h2),
            other => panic!("expected two created snapshots, got {other:?}"),
        }
    }

    #[test]
    fn test_rollback_restores_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let recorder = configured_recorder(dir.path());
        recorder.snapshot("baseline").unwrap();

        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        recorder.snapshot("edit").unwrap();

        recorder.rollback(1).unwrap();
        let restored = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(restored, "one");
    }

    #[test]
    fn test_rollback_plan_carries_handle_and_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let recorder = configured_recorder(dir.path());
        let outcome = recorder.snapshot("baseline").unwrap();
        let handle = match outcome {
            SnapshotOutcome::Created { handle } => handle,
            SnapshotOutcome::NoChanges => panic!("expected commit"),
        };

        let plan = recorder.rollback_plan(Some(&handle));
        assert_eq!(plan.handle, Some(handle));
        assert!(plan.command.contains("git reset --hard"));
        assert!(plan.recent_history.unwrap().contains("baseline"));
    }
}
