//! Package builder: archive a passing workspace and emit a deploy script.
//!
//! The script is generated text; executing it is an operator action. The
//! passing-report precondition is re-asserted here: building a package from
//! a non-passing report is a contract violation and fails before any
//! archive bytes are written.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::check::VerificationReport;
use crate::error::{Result, StagegateError};
use crate::staging::Workspace;

/// A built deployment package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageArtifact {
    pub archive_path: PathBuf,
    pub deploy_script_path: PathBuf,

    /// Hex sha-256 of the archive bytes, for post-copy integrity checks.
    pub digest: String,
}

/// Builds tar.gz update packages from verified workspaces.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    packages_dir: PathBuf,

    /// Command the deploy script uses to stop the running service.
    pub stop_command: String,

    /// Command the deploy script uses to restart the service.
    pub start_command: String,
}

impl PackageBuilder {
    pub fn new(packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            stop_command: "./stop.sh".to_string(),
            start_command: "./run.sh".to_string(),
        }
    }

    /// Archive the workspace and write the companion deploy script.
    pub fn build(
        &self,
        workspace: &Workspace,
        report: &VerificationReport,
    ) -> Result<PackageArtifact> {
        if !report.all_passed {
            return Err(StagegateError::ContractViolation(
                "refusing to package a workspace whose required checks did not pass".to_string(),
            ));
        }

        std::fs::create_dir_all(&self.packages_dir)?;

        let stamp = workspace.created_at.format("%Y%m%d_%H%M%S");
        let archive_path = self.packages_dir.join(format!("update_{}.tar.gz", workspace.id));
        let script_path = self
            .packages_dir
            .join(format!("deploy_update_{}.sh", workspace.id));

        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all(".", &workspace.root)
            .map_err(|e| StagegateError::Packaging(format!("archiving workspace: {e}")))?;
        builder
            .into_inner()
            .and_then(|enc| enc.finish())
            .map_err(|e| StagegateError::Packaging(format!("finalizing archive: {e}")))?;

        let digest = file_sha256(&archive_path)?;

        let script = self.deploy_script(&archive_path, &stamp.to_string());
        std::fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        }

        info!(
            archive = %archive_path.display(),
            digest = %digest,
            "update package built"
        );

        Ok(PackageArtifact {
            archive_path,
            deploy_script_path: script_path,
            digest,
        })
    }

    /// Generated shell text: stop, back up the live tree, extract, restart.
    fn deploy_script(&self, archive_path: &std::path::Path, stamp: &str) -> String {
        format!(
            r#"#!/bin/bash
# Self-update deployment script
# Generated: {stamp}
set -euo pipefail

echo "stagegate update deployment"
echo "==========================="

# Stop the running service
{stop}

# Back up the current tree before extracting anything over it
backup_dir="./backup_pre_update_{stamp}"
cp -r . "$backup_dir"

# Extract the verified update over the live tree
tar -xzf "{archive}"

# Restart the service
{start}

echo "update deployed; previous tree kept at $backup_dir"
"#,
            stamp = stamp,
            stop = self.stop_command,
            archive = archive_path.display(),
            start = self.start_command,
        )
    }
}

fn file_sha256(path: &std::path::Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckResult, VerificationReport};
    use chrono::Utc;

    fn passing_report() -> VerificationReport {
        VerificationReport::from_results(vec![CheckResult {
            name: "test_suite".to_string(),
            passed: true,
            diagnostic: String::new(),
            timed_out: false,
            required: true,
        }])
    }

    fn failing_report() -> VerificationReport {
        VerificationReport::from_results(vec![CheckResult {
            name: "test_suite".to_string(),
            passed: false,
            diagnostic: "boom".to_string(),
            timed_out: false,
            required: true,
        }])
    }

    fn workspace_with_file() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')").unwrap();
        let ws = Workspace {
            id: "staging_20250101_000000_abcd1234".to_string(),
            root: dir.path().to_path_buf(),
            created_at: Utc::now(),
        };
        (dir, ws)
    }

    #[test]
    fn test_build_produces_archive_script_and_digest() {
        let (_guard, ws) = workspace_with_file();
        let out = tempfile::tempdir().unwrap();

        let artifact = PackageBuilder::new(out.path())
            .build(&ws, &passing_report())
            .unwrap();

        assert!(artifact.archive_path.is_file());
        assert!(artifact.deploy_script_path.is_file());
        assert_eq!(artifact.digest.len(), 64);

        let script = std::fs::read_to_string(&artifact.deploy_script_path).unwrap();
        assert!(script.contains("tar -xzf"));
        assert!(script.contains("./stop.sh"));
        assert!(script.contains("./run.sh"));
        assert!(script.contains("backup_pre_update_"));
    }

    #[test]
    fn test_build_rejects_failing_report_without_artifacts() {
        let (_guard, ws) = workspace_with_file();
        let out = tempfile::tempdir().unwrap();

        let err = PackageBuilder::new(out.path()).build(&ws, &failing_report());
        assert!(matches!(err, Err(StagegateError::ContractViolation(_))));

        // Nothing may be left behind in the packages directory.
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_deploy_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let (_guard, ws) = workspace_with_file();
        let out = tempfile::tempdir().unwrap();

        let artifact = PackageBuilder::new(out.path())
            .build(&ws, &passing_report())
            .unwrap();
        let mode = std::fs::metadata(&artifact.deploy_script_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
