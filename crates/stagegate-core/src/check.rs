//! Verification check definitions and report types.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::changeset::CandidateChangeSet;
use crate::config::{GenerationConfig, VerifyConfig};

/// Whether a check's result blocks promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPolicy {
    /// Failure blocks promotion.
    Required,

    /// Result is recorded for diagnostics only. Used for the live smoke
    /// check, which is inherently timing- and port-sensitive and must not
    /// become a false blocker.
    Advisory,
}

/// How a check is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Run the command to completion; pass iff exit code is zero.
    Command,

    /// Start the command, let it run for `grace`, pass iff it is still
    /// alive, then terminate it (gracefully first, forced after
    /// `shutdown_wait`).
    Smoke {
        grace: Duration,
        shutdown_wait: Duration,
    },
}

/// One named verification step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,

    /// Command to execute; first element is the executable.
    pub command: Vec<String>,

    /// Independent timeout for this check.
    pub timeout: Duration,

    pub policy: CheckPolicy,

    pub kind: CheckKind,
}

impl CheckSpec {
    pub fn required(name: &str, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            command,
            timeout,
            policy: CheckPolicy::Required,
            kind: CheckKind::Command,
        }
    }

    pub fn advisory_smoke(
        name: &str,
        command: Vec<String>,
        grace: Duration,
        shutdown_wait: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            command,
            // The smoke check is bounded by its grace window plus shutdown
            // escalation, not by a completion timeout.
            timeout: grace + shutdown_wait,
            policy: CheckPolicy::Advisory,
            kind: CheckKind::Smoke {
                grace,
                shutdown_wait,
            },
        }
    }
}

/// Immutable result of one executed check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,

    /// Combined output or error text captured from the check.
    pub diagnostic: String,

    pub timed_out: bool,

    /// Whether this check participates in `all_passed`.
    pub required: bool,
}

/// Ordered results of one verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,

    /// Logical AND over the *required* checks only. Advisory checks (the
    /// live smoke check) are recorded above but deliberately excluded here.
    pub all_passed: bool,
}

impl VerificationReport {
    pub fn from_results(checks: Vec<CheckResult>) -> Self {
        let all_passed = checks.iter().filter(|c| c.required).all(|c| c.passed);
        Self { checks, all_passed }
    }

    /// Failing checks, required first.
    pub fn failures(&self) -> Vec<&CheckResult> {
        let mut failed: Vec<&CheckResult> = self.checks.iter().filter(|c| !c.passed).collect();
        failed.sort_by_key(|c| !c.required);
        failed
    }

    /// Human-readable summary of failing checks, used to seed retry prompts.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|c| {
                if c.timed_out {
                    format!("{}: timed out\n{}", c.name, c.diagnostic)
                } else {
                    format!("{}: failed\n{}", c.name, c.diagnostic)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The fixed self-update check suite, in execution order.
pub fn self_update_suite(cfg: &VerifyConfig) -> Vec<CheckSpec> {
    vec![
        CheckSpec::required(
            "test_suite",
            cfg.test_command.clone(),
            Duration::from_secs(cfg.test_timeout_secs),
        ),
        CheckSpec::required(
            "entrypoint_import",
            cfg.entrypoint_check.clone(),
            Duration::from_secs(cfg.import_timeout_secs),
        ),
        CheckSpec::required(
            "dependency_import",
            cfg.dependency_check.clone(),
            Duration::from_secs(cfg.import_timeout_secs),
        ),
        CheckSpec::advisory_smoke(
            "live_smoke",
            cfg.smoke_command.clone(),
            Duration::from_secs(cfg.smoke_grace_secs),
            Duration::from_secs(cfg.smoke_shutdown_secs),
        ),
    ]
}

/// The generation-path suite: one required check per produced test file.
///
/// A candidate with no test files yields an empty suite, which verifies
/// vacuously — absence of tests is not a failure.
pub fn generation_suite(cfg: &GenerationConfig, changeset: &CandidateChangeSet) -> Vec<CheckSpec> {
    changeset
        .test_entries()
        .map(|entry| {
            let mut command = cfg.test_command.clone();
            command.push(entry.path.to_string_lossy().to_string());
            CheckSpec::required(
                &format!("test:{}", file_label(&entry.path)),
                command,
                Duration::from_secs(cfg.test_timeout_secs),
            )
        })
        .collect()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
