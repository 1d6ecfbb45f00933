//! Pipeline configuration: on-disk layout and check suite parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// On-disk layout for pipeline output, rooted at the source tree.
///
/// Staging workspaces and packages live under `self_updates/` so the
/// materializer's exclusion rules can keep them out of future copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layout {
    /// Root of the running tree.
    pub source_root: PathBuf,
}

impl Layout {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    /// Directory holding staging workspaces.
    pub fn staging_dir(&self) -> PathBuf {
        self.source_root.join("self_updates").join("staging")
    }

    /// Directory holding update packages and deploy scripts.
    pub fn packages_dir(&self) -> PathBuf {
        self.source_root.join("self_updates").join("packages")
    }

    /// Scratch directory for generated candidates.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.source_root.join("sandbox")
    }

    /// Destination for explicitly promoted generated code.
    pub fn generated_dir(&self) -> PathBuf {
        self.source_root.join("generated")
    }

    /// Create the layout directories if they do not exist.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.staging_dir(),
            self.packages_dir(),
            self.sandbox_dir(),
            self.generated_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Self-update verification suite parameters.
///
/// Commands are configurable so the suite can gate any locally runnable
/// service; defaults mirror a Python service tree (pytest suite, import
/// checks, uvicorn smoke start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Test-suite command, run from the workspace root.
    pub test_command: Vec<String>,

    /// Command that loads the primary entrypoint in a fresh process.
    pub entrypoint_check: Vec<String>,

    /// Command that loads the critical internal dependency.
    pub dependency_check: Vec<String>,

    /// Command that starts the service for the live smoke check.
    pub smoke_command: Vec<String>,

    /// Timeout for the test suite, in seconds.
    pub test_timeout_secs: u64,

    /// Timeout for each import check, in seconds.
    pub import_timeout_secs: u64,

    /// Grace window the smoke process must survive, in seconds.
    pub smoke_grace_secs: u64,

    /// Bounded wait for graceful smoke shutdown before forced kill, in seconds.
    pub smoke_shutdown_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            test_command: to_vec(&["python3", "-m", "pytest", "backend/tests/", "-v"]),
            entrypoint_check: to_vec(&[
                "python3",
                "-c",
                "from backend.main import app; print('entrypoint ok')",
            ]),
            dependency_check: to_vec(&[
                "python3",
                "-c",
                "from backend.models.llm_connector import get_llm_response; print('dependency ok')",
            ]),
            smoke_command: to_vec(&[
                "python3",
                "-m",
                "uvicorn",
                "backend.main:app",
                "--port",
                "8001",
            ]),
            test_timeout_secs: 60,
            import_timeout_secs: 30,
            smoke_grace_secs: 3,
            smoke_shutdown_secs: 5,
        }
    }
}

/// Generation-path parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Test-harness command prefix; the test file path is appended.
    pub test_command: Vec<String>,

    /// Timeout per generated test file, in seconds.
    pub test_timeout_secs: u64,

    /// Retries after the initial attempt.
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            test_command: to_vec(&["python3", "-m", "pytest", "-v"]),
            test_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

fn to_vec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
