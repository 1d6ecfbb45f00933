//! stagegate core library
//!
//! A verify-and-promote pipeline for local code mutation: candidate file
//! sets are materialized into isolated workspaces, verified by an ordered,
//! timeout-bounded check suite, and promoted only when every required
//! check passes — with a git recovery point recorded before any mutation.
//!
//! Two flows share the core:
//! - self-update: backup, full-tree staging, verification, and packaging
//!   for operator deployment ([`update::SelfUpdatePipeline`]),
//! - generation: a bounded draft/verify retry loop over a candidate
//!   producer ([`retry::RetryController`]).

pub mod backup;
pub mod changeset;
pub mod check;
pub mod config;
pub mod error;
pub mod gate;
pub mod package;
pub mod parser;
pub mod producer;
pub mod retry;
pub mod staging;
pub mod telemetry;
pub mod update;
pub mod verify;

pub use backup::{BackupHandle, BackupRecorder, RollbackPlan, SnapshotOutcome};
pub use changeset::{CandidateChangeSet, ChangeEntry, FileKind};
pub use check::{
    generation_suite, self_update_suite, CheckKind, CheckPolicy, CheckResult, CheckSpec,
    VerificationReport,
};
pub use config::{GenerationConfig, Layout, VerifyConfig};
pub use error::{Result, StagegateError};
pub use gate::{promote_into_tree, GateDecision, PromotionGate};
pub use package::{PackageArtifact, PackageBuilder};
pub use parser::parse_response;
pub use producer::HttpChatProducer;
pub use retry::{CandidateProducer, GeneratedCandidate, RetryController};
pub use staging::{ExcludeRules, Materializer, Workspace};
pub use telemetry::init_tracing;
pub use update::{SelfUpdateOutcome, SelfUpdatePipeline};
pub use verify::VerificationRunner;

/// stagegate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
