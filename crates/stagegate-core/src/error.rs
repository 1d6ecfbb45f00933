//! Domain-level error taxonomy for stagegate.
//!
//! Three families of failure move through the pipeline:
//! - infrastructure faults (git, filesystem copy, producer transport) abort
//!   the current flow and carry the raw diagnostic,
//! - verification failures are *not* errors — they travel as data inside
//!   [`crate::check::VerificationReport`],
//! - contract violations (packaging or promoting a non-passing report) fail
//!   fast as [`StagegateError::ContractViolation`].

/// Stagegate domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StagegateError {
    #[error("invalid changeset path: {0}")]
    InvalidPath(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("packaging error: {0}")]
    Packaging(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("producer unavailable: {0}")]
    ProducerUnavailable(String),

    #[error("malformed producer response: {0}")]
    MalformedResponse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stagegate domain operations.
pub type Result<T> = std::result::Result<T, StagegateError>;
