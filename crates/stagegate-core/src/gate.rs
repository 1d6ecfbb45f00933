//! Promotion gate: all-required-checks-must-pass policy.
//!
//! The gate only decides; it never mutates the running tree. On the
//! self-update path, Promote hands off to the package builder and Block
//! returns the report plus the rollback plan as data. On the generation
//! path, acceptance marks a candidate ready for a separate, explicitly
//! invoked promotion step, which re-asserts the same precondition.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::changeset::CandidateChangeSet;
use crate::check::VerificationReport;
use crate::error::{Result, StagegateError};

/// Verdict of the promotion gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Promote,
    Block { violations: Vec<String> },
}

impl GateDecision {
    pub fn is_promote(&self) -> bool {
        matches!(self, GateDecision::Promote)
    }
}

/// Applies the promotion policy to a verification report.
pub struct PromotionGate;

impl PromotionGate {
    /// Promote iff every required check passed.
    pub fn decide(report: &VerificationReport) -> GateDecision {
        if report.all_passed {
            return GateDecision::Promote;
        }
        let violations = report
            .failures()
            .iter()
            .filter(|c| c.required)
            .map(|c| {
                if c.timed_out {
                    format!("check '{}' timed out", c.name)
                } else {
                    format!("check '{}' failed", c.name)
                }
            })
            .collect();
        GateDecision::Block { violations }
    }

    /// Generation-path acceptance: the candidate's tests all passed, or the
    /// candidate produced no tests at all (vacuously acceptable).
    pub fn accept_candidate(report: &VerificationReport, test_file_count: usize) -> bool {
        test_file_count == 0 || report.all_passed
    }
}

/// Move an accepted candidate's code files into the running tree.
///
/// This is the explicit implementation step that follows generation-path
/// acceptance; it is never invoked by the retry loop itself. The passing
/// precondition is re-asserted here: promoting with a non-passing report is
/// a contract violation.
pub fn promote_into_tree(
    workspace_root: &Path,
    changeset: &CandidateChangeSet,
    report: &VerificationReport,
    dest_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let test_count = changeset.test_entries().count();
    if !PromotionGate::accept_candidate(report, test_count) {
        return Err(StagegateError::ContractViolation(
            "refusing to promote a candidate whose required checks did not pass".to_string(),
        ));
    }

    std::fs::create_dir_all(dest_dir)?;
    let mut promoted = Vec::new();
    for entry in changeset.code_entries() {
        let source = workspace_root.join(&entry.path);
        let file_name = entry.path.file_name().ok_or_else(|| {
            StagegateError::InvalidPath(format!("entry has no file name: {}", entry.path.display()))
        })?;
        let target = dest_dir.join(file_name);
        std::fs::copy(&source, &target)?;
        info!(file = %target.display(), "promoted generated file");
        promoted.push(target);
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileKind;
    use crate::check::CheckResult;

    fn report(required_pass: bool, advisory_pass: bool) -> VerificationReport {
        VerificationReport::from_results(vec![
            CheckResult {
                name: "test_suite".to_string(),
                passed: required_pass,
                diagnostic: String::new(),
                timed_out: false,
                required: true,
            },
            CheckResult {
                name: "live_smoke".to_string(),
                passed: advisory_pass,
                diagnostic: String::new(),
                timed_out: false,
                required: false,
            },
        ])
    }

    #[test]
    fn test_promote_when_required_pass() {
        assert!(PromotionGate::decide(&report(true, true)).is_promote());
        // Advisory failure alone never blocks.
        assert!(PromotionGate::decide(&report(true, false)).is_promote());
    }

    #[test]
    fn test_block_lists_required_violations_only() {
        match PromotionGate::decide(&report(false, false)) {
            GateDecision::Block { violations } => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].contains("test_suite"));
            }
            GateDecision::Promote => panic!("required failure must block"),
        }
    }

    #[test]
    fn test_accept_candidate_without_tests() {
        let empty = VerificationReport::from_results(vec![]);
        assert!(PromotionGate::accept_candidate(&empty, 0));
    }

    #[test]
    fn test_promote_into_tree_moves_code_not_tests() {
        let workspace = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let mut changes = CandidateChangeSet::new();
        changes
            .insert("feature.py", "code".into(), FileKind::Code)
            .unwrap();
        changes
            .insert("test_feature.py", "test".into(), FileKind::Test)
            .unwrap();
        std::fs::write(workspace.path().join("feature.py"), "code").unwrap();
        std::fs::write(workspace.path().join("test_feature.py"), "test").unwrap();

        let promoted = promote_into_tree(
            workspace.path(),
            &changes,
            &report(true, true),
            dest.path(),
        )
        .unwrap();

        assert_eq!(promoted.len(), 1);
        assert!(dest.path().join("feature.py").is_file());
        assert!(!dest.path().join("test_feature.py").exists());
    }

    #[test]
    fn test_promote_into_tree_rejects_failing_report() {
        let workspace = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let mut changes = CandidateChangeSet::new();
        changes
            .insert("feature.py", "code".into(), FileKind::Code)
            .unwrap();
        changes
            .insert("test_feature.py", "test".into(), FileKind::Test)
            .unwrap();

        let err = promote_into_tree(
            workspace.path(),
            &changes,
            &report(false, true),
            dest.path(),
        );
        assert!(matches!(err, Err(StagegateError::ContractViolation(_))));
    }
}
