//! Bounded retry loop for candidate generation.
//!
//! State machine over attempts: draft a candidate from the producer,
//! materialize and verify it, then accept, retry with the failure summary
//! folded into the next instruction, or stop exhausted. The last candidate
//! is always returned for inspection, never silently discarded.
//!
//! Producer transport failures are retryable while attempts remain; once
//! the budget is spent they surface as an infrastructure error, which is a
//! different terminal state than verification exhaustion.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::changeset::CandidateChangeSet;
use crate::check::{generation_suite, VerificationReport};
use crate::config::GenerationConfig;
use crate::error::{Result, StagegateError};
use crate::gate::PromotionGate;
use crate::parser::parse_response;
use crate::staging::{Materializer, Workspace};
use crate::verify::VerificationRunner;

/// Produces candidate responses from a free-text instruction plus optional
/// named context files.
#[async_trait]
pub trait CandidateProducer: Send + Sync {
    /// Returns free text containing zero or more fenced code blocks.
    ///
    /// Transport-level failures (unreachable, timeout) must map to
    /// [`StagegateError::ProducerUnavailable`].
    async fn produce(
        &self,
        instruction: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Why the previous attempt failed, shaping the next instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The candidate was verified and its checks failed.
    Verification { summary: String },

    /// No candidate reached verification: producer transport fault or an
    /// unparseable response.
    Delivery { detail: String },
}

/// Per-attempt bookkeeping, discarded when the loop ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptState {
    pub attempt_number: u32,
    pub last_failure: Option<AttemptFailure>,
    pub created_files: Vec<String>,
}

/// Terminal result of the generation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCandidate {
    /// The produced file set from the final attempt.
    pub changeset: CandidateChangeSet,

    /// Scratch workspace holding the final candidate, when one was
    /// materialized.
    pub workspace: Option<Workspace>,

    /// Verification report from the final attempt.
    pub report: Option<VerificationReport>,

    /// Total attempts consumed.
    pub attempts: u32,

    /// True when the candidate's tests passed (or it produced none) and it
    /// may be handed to the explicit promotion step.
    pub ready_for_implementation: bool,

    /// Human-readable outcome message.
    pub message: String,
}

/// Drives the draft/verify/retry loop against a producer.
pub struct RetryController<'a> {
    producer: &'a dyn CandidateProducer,
    materializer: &'a Materializer,
    config: GenerationConfig,
}

impl<'a> RetryController<'a> {
    pub fn new(
        producer: &'a dyn CandidateProducer,
        materializer: &'a Materializer,
        config: GenerationConfig,
    ) -> Self {
        Self {
            producer,
            materializer,
            config,
        }
    }

    /// Run the loop: at most `1 + max_retries` attempts.
    pub async fn generate(
        &self,
        instruction: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<GeneratedCandidate> {
        let total_attempts = self.config.max_retries + 1;
        let mut state = AttemptState {
            attempt_number: 0,
            last_failure: None,
            created_files: Vec::new(),
        };
        let mut last: Option<(CandidateChangeSet, Workspace, VerificationReport)> = None;

        for attempt in 1..=total_attempts {
            state.attempt_number = attempt;
            let prompt = match &state.last_failure {
                Some(AttemptFailure::Verification { summary }) => {
                    repair_instruction(instruction, summary)
                }
                // Nothing to repair when no code arrived; restate the
                // original request.
                Some(AttemptFailure::Delivery { .. }) | None => drafting_instruction(instruction),
            };

            info!(attempt, total_attempts, "requesting candidate from producer");
            let response = match self.producer.produce(&prompt, context).await {
                Ok(response) => response,
                Err(StagegateError::ProducerUnavailable(msg)) if attempt < total_attempts => {
                    warn!(attempt, error = %msg, "producer unreachable; retrying");
                    state.last_failure = Some(AttemptFailure::Delivery {
                        detail: format!("producer transport failure: {msg}"),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let changeset = match parse_response(&response) {
                Ok(changeset) => changeset,
                Err(StagegateError::MalformedResponse(msg)) if attempt < total_attempts => {
                    warn!(attempt, error = %msg, "malformed producer response; retrying");
                    state.last_failure = Some(AttemptFailure::Delivery {
                        detail: format!("response parse failure: {msg}"),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            state.created_files = changeset
                .entries()
                .iter()
                .map(|e| e.path.to_string_lossy().to_string())
                .collect();

            let workspace = self.materializer.materialize_scratch(&changeset)?;
            let suite = generation_suite(&self.config, &changeset);
            let report = VerificationRunner::verify(&workspace.root, &suite).await;

            let test_count = changeset.test_entries().count();
            if PromotionGate::accept_candidate(&report, test_count) {
                info!(attempt, files = changeset.len(), "candidate accepted");
                let message = if test_count == 0 {
                    format!("accepted after {attempt} attempt(s); no test files produced")
                } else {
                    format!("all generated tests passed after {attempt} attempt(s)")
                };
                return Ok(GeneratedCandidate {
                    changeset,
                    workspace: Some(workspace),
                    report: Some(report),
                    attempts: attempt,
                    ready_for_implementation: true,
                    message,
                });
            }

            warn!(attempt, "candidate failed verification");
            state.last_failure = Some(AttemptFailure::Verification {
                summary: report.failure_summary(),
            });
            last = Some((changeset, workspace, report));
        }

        // Exhausted: return the last candidate for manual inspection.
        let (changeset, workspace, report) = match last {
            Some(parts) => parts,
            // Every attempt died before verification (transport/parse); the
            // final failure already returned above, so this is transport
            // exhaustion.
            None => {
                let detail = match state.last_failure {
                    Some(AttemptFailure::Delivery { detail }) => detail,
                    Some(AttemptFailure::Verification { summary }) => summary,
                    None => String::new(),
                };
                return Err(StagegateError::ProducerUnavailable(format!(
                    "no verifiable candidate produced in {total_attempts} attempt(s): {detail}"
                )));
            }
        };

        Ok(GeneratedCandidate {
            changeset,
            workspace: Some(workspace),
            report: Some(report),
            attempts: total_attempts,
            ready_for_implementation: false,
            message: format!(
                "tests still failing after {total_attempts} attempt(s); manual review needed"
            ),
        })
    }
}

fn drafting_instruction(request: &str) -> String {
    format!(
        "Please help me with the following request: {request}\n\n\
         Provide your response as:\n\
         1. A brief explanation of what you are creating\n\
         2. The main code in fenced code blocks\n\
         3. A corresponding test file in fenced code blocks\n\n\
         Declare a filename in each block with a comment like:\n\
         # Filename: my_feature.py\n\n\
         All code must be production-ready with proper error handling."
    )
}

fn repair_instruction(request: &str, diagnostic: &str) -> String {
    format!(
        "The previous code had verification failures. Please fix them.\n\n\
         Failure summary:\n{diagnostic}\n\n\
         Original request: {request}\n\n\
         Provide the complete corrected files in the same fenced-block \
         format, fixing imports, syntax and logic errors."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::ExcludeRules;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Producer returning a canned response per attempt.
    struct ScriptedProducer {
        responses: Vec<Result<String>>,
        calls: AtomicU32,
    }

    impl ScriptedProducer {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CandidateProducer for ScriptedProducer {
        async fn produce(
            &self,
            _instruction: &str,
            _context: &BTreeMap<String, String>,
        ) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.responses.get(n) {
                Some(Ok(s)) => Ok(s.clone()),
                Some(Err(StagegateError::ProducerUnavailable(m))) => {
                    Err(StagegateError::ProducerUnavailable(m.clone()))
                }
                Some(Err(_)) => unreachable!("scripted errors are transport-only"),
                None => panic!("producer called more times than scripted"),
            }
        }
    }

    fn shell_config() -> GenerationConfig {
        GenerationConfig {
            test_command: vec!["sh".to_string()],
            test_timeout_secs: 10,
            max_retries: 3,
        }
    }

    fn passing_response() -> String {
        "```sh\n# Filename: test_candidate.sh\nexit 0\n```".to_string()
    }

    fn failing_response() -> String {
        "```sh\n# Filename: test_candidate.sh\nexit 1\n```".to_string()
    }

    #[tokio::test]
    async fn test_accepts_on_third_attempt() {
        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer = ScriptedProducer::new(vec![
            Ok(failing_response()),
            Ok(failing_response()),
            Ok(passing_response()),
        ]);

        let controller = RetryController::new(&producer, &materializer, shell_config());
        let candidate = controller
            .generate("make a feature", &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(candidate.attempts, 3);
        assert_eq!(producer.calls(), 3);
        assert!(candidate.ready_for_implementation);
        assert!(candidate.report.unwrap().all_passed);
    }

    #[tokio::test]
    async fn test_exhausted_after_initial_plus_retries() {
        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer =
            ScriptedProducer::new(vec![Ok(failing_response()), Ok(failing_response())]);

        let config = GenerationConfig {
            max_retries: 1,
            ..shell_config()
        };
        let controller = RetryController::new(&producer, &materializer, config);
        let candidate = controller
            .generate("make a feature", &BTreeMap::new())
            .await
            .unwrap();

        // max_retries = 1 means exactly two total attempts.
        assert_eq!(candidate.attempts, 2);
        assert_eq!(producer.calls(), 2);
        assert!(!candidate.ready_for_implementation);
        // The failing candidate is still returned for inspection.
        assert_eq!(candidate.changeset.len(), 1);
        assert!(!candidate.report.unwrap().all_passed);
    }

    #[tokio::test]
    async fn test_no_test_files_is_vacuously_accepted() {
        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer = ScriptedProducer::new(vec![Ok(
            "```python\n# Filename: feature.py\nx = 1\n```".to_string()
        )]);

        let controller = RetryController::new(&producer, &materializer, shell_config());
        let candidate = controller
            .generate("make a feature", &BTreeMap::new())
            .await
            .unwrap();

        assert!(candidate.ready_for_implementation);
        assert_eq!(candidate.attempts, 1);
        assert!(candidate.message.contains("no test files"));
    }

    #[tokio::test]
    async fn test_transport_failure_retried_then_succeeds() {
        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer = ScriptedProducer::new(vec![
            Err(StagegateError::ProducerUnavailable("refused".to_string())),
            Ok(passing_response()),
        ]);

        let controller = RetryController::new(&producer, &materializer, shell_config());
        let candidate = controller
            .generate("make a feature", &BTreeMap::new())
            .await
            .unwrap();

        assert!(candidate.ready_for_implementation);
        assert_eq!(candidate.attempts, 2);
    }

    #[tokio::test]
    async fn test_transport_retry_restates_request_without_repair_framing() {
        struct RecordingProducer {
            inner: ScriptedProducer,
            prompts: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl CandidateProducer for RecordingProducer {
            async fn produce(
                &self,
                instruction: &str,
                context: &BTreeMap<String, String>,
            ) -> Result<String> {
                self.prompts.lock().unwrap().push(instruction.to_string());
                self.inner.produce(instruction, context).await
            }
        }

        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer = RecordingProducer {
            inner: ScriptedProducer::new(vec![
                Err(StagegateError::ProducerUnavailable("refused".to_string())),
                Ok(passing_response()),
            ]),
            prompts: std::sync::Mutex::new(Vec::new()),
        };

        let controller = RetryController::new(&producer, &materializer, shell_config());
        let candidate = controller
            .generate("make a feature", &BTreeMap::new())
            .await
            .unwrap();
        assert!(candidate.ready_for_implementation);

        // The first attempt produced no code, so the second instruction must
        // not claim there were verification failures to fix.
        let prompts = producer.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[1].contains("verification failures"));
        assert_eq!(prompts[0], prompts[1]);
    }

    #[tokio::test]
    async fn test_transport_exhaustion_is_infrastructure_error() {
        let staging = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(staging.path(), ExcludeRules::defaults().unwrap());
        let producer = ScriptedProducer::new(vec![
            Err(StagegateError::ProducerUnavailable("refused".to_string())),
            Err(StagegateError::ProducerUnavailable("refused".to_string())),
        ]);

        let config = GenerationConfig {
            max_retries: 1,
            ..shell_config()
        };
        let controller = RetryController::new(&producer, &materializer, config);
        let err = controller.generate("make a feature", &BTreeMap::new()).await;

        assert!(matches!(err, Err(StagegateError::ProducerUnavailable(_))));
    }
}
