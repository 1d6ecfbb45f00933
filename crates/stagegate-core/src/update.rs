//! Self-update pipeline: backup -> materialize -> verify -> gate -> package.
//!
//! The backup snapshot is the first mutating action and a hard
//! precondition: no staging happens without a recovery point. The pipeline
//! never touches the live tree beyond that snapshot — promotion produces a
//! package plus a deploy script for the operator, and a blocked run reports
//! the rollback plan as data.

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::{BackupRecorder, RollbackPlan, SnapshotOutcome};
use crate::changeset::CandidateChangeSet;
use crate::check::{self_update_suite, VerificationReport};
use crate::config::{Layout, VerifyConfig};
use crate::error::Result;
use crate::gate::{GateDecision, PromotionGate};
use crate::package::{PackageArtifact, PackageBuilder};
use crate::staging::{ExcludeRules, Materializer, Workspace};
use crate::verify::VerificationRunner;

/// Terminal outcome of a self-update run.
///
/// Both variants carry the full report and the rollback plan so a caller
/// can always distinguish "blocked for safety" from "infrastructure broke"
/// (the latter surfaces as an `Err` from [`SelfUpdatePipeline::run`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SelfUpdateOutcome {
    ReadyForDeployment {
        backup: SnapshotOutcome,
        workspace: Workspace,
        report: VerificationReport,
        package: PackageArtifact,
        rollback: RollbackPlan,
        message: String,
    },
    Blocked {
        backup: SnapshotOutcome,
        workspace: Workspace,
        report: VerificationReport,
        violations: Vec<String>,
        rollback: RollbackPlan,
        message: String,
    },
}

impl SelfUpdateOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, SelfUpdateOutcome::ReadyForDeployment { .. })
    }
}

/// Orchestrates the verify-and-promote flow for self-modification.
pub struct SelfUpdatePipeline {
    layout: Layout,
    verify: VerifyConfig,
    packager: PackageBuilder,
}

impl SelfUpdatePipeline {
    pub fn new(layout: Layout, verify: VerifyConfig) -> Self {
        let packager = PackageBuilder::new(layout.packages_dir());
        Self {
            layout,
            verify,
            packager,
        }
    }

    /// Override the default package builder (service stop/start commands).
    pub fn with_packager(mut self, packager: PackageBuilder) -> Self {
        self.packager = packager;
        self
    }

    /// Run the full flow for a proposed changeset.
    ///
    /// An empty changeset is valid: the current tree is materialized
    /// verbatim and verified in isolation.
    pub async fn run(&self, changeset: &CandidateChangeSet) -> Result<SelfUpdateOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("self_update", run_id = %run_id);
        self.run_inner(changeset).instrument(span).await
    }

    async fn run_inner(&self, changeset: &CandidateChangeSet) -> Result<SelfUpdateOutcome> {
        self.layout.ensure()?;

        // Recovery point first; backup failure aborts the whole flow.
        let recorder = BackupRecorder::new(&self.layout.source_root);
        let backup = recorder.snapshot("Backup before self-update")?;
        match &backup {
            SnapshotOutcome::Created { handle } => {
                info!(handle = %handle, "recovery point recorded")
            }
            SnapshotOutcome::NoChanges => info!("no changes since last recovery point"),
        }

        let materializer = Materializer::new(self.layout.staging_dir(), ExcludeRules::defaults()?);
        let workspace = materializer.materialize_full(&self.layout.source_root, changeset)?;

        let suite = self_update_suite(&self.verify);
        let report = VerificationRunner::verify(&workspace.root, &suite).await;

        let handle = match &backup {
            SnapshotOutcome::Created { handle } => Some(handle.clone()),
            SnapshotOutcome::NoChanges => None,
        };
        let rollback = recorder.rollback_plan(handle.as_ref());

        match PromotionGate::decide(&report) {
            GateDecision::Promote => {
                let package = self.packager.build(&workspace, &report)?;
                info!(archive = %package.archive_path.display(), "self-update ready for deployment");
                Ok(SelfUpdateOutcome::ReadyForDeployment {
                    backup,
                    workspace,
                    report,
                    package,
                    rollback,
                    message: "all required checks passed; update package ready for deployment"
                        .to_string(),
                })
            }
            GateDecision::Block { violations } => {
                warn!(?violations, "self-update blocked");
                let message = format!(
                    "self-update blocked for safety: {}; rollback available via `{}`",
                    violations.join("; "),
                    rollback.command
                );
                Ok(SelfUpdateOutcome::Blocked {
                    backup,
                    workspace,
                    report,
                    violations,
                    rollback,
                    message,
                })
            }
        }
    }
}
