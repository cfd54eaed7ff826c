//! Sandbox executor: trial a proposal against a disposable copy.
//!
//! The copy lives in a `tempfile` directory that is removed when the trial
//! ends, success or not — a timed-out child is killed and the workspace still
//! unwinds. Order of operations is the pipeline's core safety invariant:
//! nothing here ever opens the live file for writing, and the orchestrator
//! only invokes the real engine after this returns `Passed`.
//!
//! Full-file proposals skip the trial: their guardrails (structural scan,
//! essential functions) run inside the engine itself.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use autopatch_core::config::ToolchainConfig;
use autopatch_core::schema::{CodePatch, LocationKind};

use crate::apply::apply_modification;
use crate::exec::{lossy, run_bounded, ExecError};

/// Context handed back to the proposal generator when a trial fails, so a
/// corrected proposal can be produced without re-reading the live tree.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackContext {
    pub file: String,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxFailReason {
    /// The trial workspace could not be prepared.
    Io,
    /// The edit itself failed on the copy (stale old_value, bad pattern…).
    Apply,
    /// The patched copy does not parse.
    Syntax,
    /// The patched copy exited non-zero.
    Runtime,
    /// The patched copy exceeded the wall-clock bound.
    Timeout,
}

impl std::fmt::Display for SandboxFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxFailReason::Io => write!(f, "io"),
            SandboxFailReason::Apply => write!(f, "apply"),
            SandboxFailReason::Syntax => write!(f, "syntax"),
            SandboxFailReason::Runtime => write!(f, "runtime"),
            SandboxFailReason::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug)]
pub struct SandboxFailure {
    pub reason: SandboxFailReason,
    pub error: String,
    pub stdout: String,
    pub stderr: String,
    /// Present for syntax failures: enough context for automated re-proposal.
    pub fallback: Option<FallbackContext>,
}

impl SandboxFailure {
    fn bare(reason: SandboxFailReason, error: String) -> Self {
        Self {
            reason,
            error,
            stdout: String::new(),
            stderr: String::new(),
            fallback: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxVerdict {
    Passed,
    /// Full-file proposal — validated by the engine's own checks instead.
    Skipped,
}

/// Trial-apply `patch` to an isolated copy of its target and execute it.
pub async fn run_sandbox_trial(
    toolchain: &ToolchainConfig,
    system_root: &Path,
    patch: &CodePatch,
) -> Result<SandboxVerdict, SandboxFailure> {
    if patch.modification.location.kind == LocationKind::FullFile {
        debug!(target: "autopatch::sandbox", file = %patch.target_file, "full-file proposal; trial skipped");
        return Ok(SandboxVerdict::Skipped);
    }

    let live = system_root.join(&patch.target_file);
    if !live.is_file() {
        return Err(SandboxFailure::bare(
            SandboxFailReason::Io,
            format!("target file not found: {}", live.display()),
        ));
    }
    let basename = live
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("sandbox_target")
        .to_string();

    let workspace = tempfile::tempdir()
        .map_err(|e| SandboxFailure::bare(SandboxFailReason::Io, e.to_string()))?;
    std::fs::copy(&live, workspace.path().join(&basename))
        .map_err(|e| SandboxFailure::bare(SandboxFailReason::Io, e.to_string()))?;

    // Same partial-edit semantics as the live engine, against the copy only.
    apply_modification(workspace.path(), &basename, &patch.modification).map_err(|e| {
        SandboxFailure::bare(SandboxFailReason::Apply, e.to_string())
    })?;

    let copy = workspace.path().join(&basename);
    let bound = Duration::from_secs(toolchain.sandbox_timeout_secs);

    // (a) the patched copy must parse.
    let check = run_bounded(&toolchain.check_cmd, &copy, bound)
        .await
        .map_err(|e| exec_failure(e, bound))?;
    if !check.status.success() {
        let stderr = lossy(&check.stderr);
        let code = std::fs::read_to_string(&copy).unwrap_or_default();
        return Err(SandboxFailure {
            reason: SandboxFailReason::Syntax,
            error: format!("syntax check failed: {}", stderr.trim()),
            stdout: lossy(&check.stdout),
            stderr,
            fallback: Some(FallbackContext {
                file: patch.target_file.clone(),
                code,
                error: "syntax check failed".to_string(),
            }),
        });
    }

    // (b) the patched copy must run cleanly within the bound.
    let run = run_bounded(&toolchain.run_cmd, &copy, bound)
        .await
        .map_err(|e| exec_failure(e, bound))?;
    if !run.status.success() {
        let stderr = lossy(&run.stderr);
        return Err(SandboxFailure {
            reason: SandboxFailReason::Runtime,
            error: format!(
                "sandbox run failed: {}",
                if stderr.trim().is_empty() {
                    format!("exit status {}", run.status)
                } else {
                    stderr.trim().to_string()
                }
            ),
            stdout: lossy(&run.stdout),
            stderr,
            fallback: None,
        });
    }

    info!(target: "autopatch::sandbox", file = %patch.target_file, "sandbox trial passed");
    Ok(SandboxVerdict::Passed)
}

fn exec_failure(e: ExecError, bound: Duration) -> SandboxFailure {
    match e {
        ExecError::Timeout => SandboxFailure::bare(
            SandboxFailReason::Timeout,
            format!("sandbox execution timed out after {}s", bound.as_secs()),
        ),
        ExecError::Spawn(e) => SandboxFailure::bare(SandboxFailReason::Io, e.to_string()),
        ExecError::EmptyCommand => {
            SandboxFailure::bare(SandboxFailReason::Io, "empty toolchain command".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopatch_core::schema::{Action, Location, Modification};

    fn toolchain(check: &[&str], run: &[&str], timeout: u64) -> ToolchainConfig {
        ToolchainConfig {
            check_cmd: check.iter().map(|s| s.to_string()).collect(),
            run_cmd: run.iter().map(|s| s.to_string()).collect(),
            load_cmd: run.iter().map(|s| s.to_string()).collect(),
            sandbox_timeout_secs: timeout,
        }
    }

    fn patch(file: &str, value: &str, new: &str) -> CodePatch {
        CodePatch {
            target_file: file.to_string(),
            modification: Modification {
                action: Action::Replace,
                location: Location {
                    kind: LocationKind::Str,
                    value: value.to_string(),
                },
                old_value: None,
                new_value: Some(new.to_string()),
            },
            metric: None,
            reason: String::new(),
            engine_used: "unknown".to_string(),
        }
    }

    #[tokio::test]
    async fn passing_trial_leaves_live_file_untouched() {
        let root = tempfile::tempdir().unwrap();
        let live = root.path().join("unit.sh");
        std::fs::write(&live, "echo before\n").unwrap();

        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 5);
        let verdict = run_sandbox_trial(&tc, root.path(), &patch("unit.sh", "before", "echo after"))
            .await
            .unwrap();
        assert_eq!(verdict, SandboxVerdict::Passed);
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "echo before\n");
    }

    #[tokio::test]
    async fn syntax_failure_carries_fallback_context() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("unit.sh"), "echo ok\n").unwrap();

        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 5);
        let failure =
            run_sandbox_trial(&tc, root.path(), &patch("unit.sh", "ok", "if then fi ((("))
                .await
                .unwrap_err();
        assert_eq!(failure.reason, SandboxFailReason::Syntax);
        let fallback = failure.fallback.expect("fallback context");
        assert_eq!(fallback.file, "unit.sh");
        assert!(fallback.code.contains("if then fi"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_runtime_failure() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("unit.sh"), "echo ok\n").unwrap();

        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 5);
        let failure = run_sandbox_trial(&tc, root.path(), &patch("unit.sh", "ok", "exit 3"))
            .await
            .unwrap_err();
        assert_eq!(failure.reason, SandboxFailReason::Runtime);
    }

    #[tokio::test]
    async fn overlong_execution_times_out() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("unit.sh"), "echo ok\n").unwrap();

        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 1);
        let failure = run_sandbox_trial(&tc, root.path(), &patch("unit.sh", "ok", "sleep 30"))
            .await
            .unwrap_err();
        assert_eq!(failure.reason, SandboxFailReason::Timeout);
    }

    #[tokio::test]
    async fn stale_old_value_fails_in_the_sandbox_too() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("unit.sh"), "echo ok\n").unwrap();

        let mut p = patch("unit.sh", "ok", "echo fine");
        p.modification.old_value = Some("not present".to_string());
        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 5);
        let failure = run_sandbox_trial(&tc, root.path(), &p).await.unwrap_err();
        assert_eq!(failure.reason, SandboxFailReason::Apply);
    }

    #[tokio::test]
    async fn full_file_proposals_skip_the_trial() {
        let root = tempfile::tempdir().unwrap();
        let mut p = patch("absent.sh", "x", "y");
        p.modification.location.kind = LocationKind::FullFile;
        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"], 5);
        // Even a missing target is fine: nothing is touched.
        let verdict = run_sandbox_trial(&tc, root.path(), &p).await.unwrap();
        assert_eq!(verdict, SandboxVerdict::Skipped);
    }
}
