//! Verification runner: sequential, timeout-bounded check execution.
//!
//! Checks run one after another in declared order with no short-circuit, so
//! the report is always complete even when an early required check fails.
//! Every child process is scoped to the workspace via `current_dir` — the
//! runner never mutates the pipeline process's own working directory, so
//! there is nothing to restore on any exit path.
//!
//! A check can fail three ways, all folded into its [`CheckResult`] rather
//! than propagated: non-zero exit, timeout (process killed, `timed_out`
//! set), or a harness error such as a spawn failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::check::{CheckKind, CheckPolicy, CheckResult, CheckSpec, VerificationReport};

/// Executes an ordered check suite against a workspace.
pub struct VerificationRunner;

impl VerificationRunner {
    /// Run every check in `suite` against `workspace` and collect a full
    /// report. Never returns an error: misbehaving checks become failed
    /// results.
    pub async fn verify(workspace: &Path, suite: &[CheckSpec]) -> VerificationReport {
        let mut results = Vec::with_capacity(suite.len());
        for spec in suite {
            let result = match &spec.kind {
                CheckKind::Command => Self::run_command_check(workspace, spec).await,
                CheckKind::Smoke {
                    grace,
                    shutdown_wait,
                } => Self::run_smoke_check(workspace, spec, *grace, *shutdown_wait).await,
            };
            if result.passed {
                info!(check = %result.name, "check passed");
            } else {
                warn!(check = %result.name, timed_out = result.timed_out, "check failed");
            }
            results.push(result);
        }
        VerificationReport::from_results(results)
    }

    async fn run_command_check(workspace: &Path, spec: &CheckSpec) -> CheckResult {
        if spec.command.is_empty() {
            return failed(spec, "check has an empty command".to_string(), false);
        }

        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout must not leave the
            // process running.
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return failed(
                    spec,
                    format!("failed to start {:?}: {e}", spec.command[0]),
                    false,
                )
            }
        };

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let diagnostic = combine_output(&output.stdout, &output.stderr);
                CheckResult {
                    name: spec.name.clone(),
                    passed: output.status.success(),
                    diagnostic,
                    timed_out: false,
                    required: spec.policy == CheckPolicy::Required,
                }
            }
            Ok(Err(e)) => failed(spec, format!("check harness error: {e}"), false),
            Err(_) => failed(
                spec,
                format!("timed out after {:?}", spec.timeout),
                true,
            ),
        }
    }

    /// Start the service, let it run for the grace window, and pass iff it
    /// is still alive afterwards. Termination is requested gracefully first
    /// and escalates to a forced kill after `shutdown_wait`.
    async fn run_smoke_check(
        workspace: &Path,
        spec: &CheckSpec,
        grace: Duration,
        shutdown_wait: Duration,
    ) -> CheckResult {
        if spec.command.is_empty() {
            return failed(spec, "check has an empty command".to_string(), false);
        }

        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return failed(
                    spec,
                    format!("failed to start {:?}: {e}", spec.command[0]),
                    false,
                )
            }
        };

        tokio::time::sleep(grace).await;

        match child.try_wait() {
            Ok(Some(status)) => failed(
                spec,
                format!("process exited during grace window with {status}"),
                false,
            ),
            Ok(None) => {
                shut_down(&mut child, shutdown_wait).await;
                CheckResult {
                    name: spec.name.clone(),
                    passed: true,
                    diagnostic: format!("process stayed alive through {grace:?} grace window"),
                    timed_out: false,
                    required: spec.policy == CheckPolicy::Required,
                }
            }
            Err(e) => failed(spec, format!("check harness error: {e}"), false),
        }
    }
}

/// Request graceful termination, wait briefly, then force a kill.
async fn shut_down(child: &mut tokio::process::Child, shutdown_wait: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM first so the service can release its port cleanly.
        let _ = Command::new("kill")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(shutdown_wait, child.wait()).await.is_ok() {
            return;
        }
        warn!("smoke process ignored graceful shutdown; killing");
    }

    #[cfg(not(unix))]
    let _ = shutdown_wait;

    let _ = child.kill().await;
}

fn failed(spec: &CheckSpec, diagnostic: String, timed_out: bool) -> CheckResult {
    CheckResult {
        name: spec.name.clone(),
        passed: false,
        diagnostic,
        timed_out,
        required: spec.policy == CheckPolicy::Required,
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).to_string();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&err);
    }
    combined
}
