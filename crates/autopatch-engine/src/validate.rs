//! Post-apply validation of the live file.
//!
//! A patch that passed its sandbox can still fail in place (environment
//! differences, import-time state). After the real write the file is
//! re-checked for syntax and then loaded/initialized once. A failure here is
//! its own class — logged for manual intervention, never auto-rolled-back.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use autopatch_core::config::ToolchainConfig;

use crate::exec::{lossy, run_bounded, ExecError};

#[derive(Debug, Error)]
pub enum PostValidateError {
    #[error("patched file does not parse: {0}")]
    Syntax(String),
    #[error("patched file failed to load: {0}")]
    Load(String),
    #[error("validation timed out")]
    Timeout,
    #[error("validation could not run: {0}")]
    Io(String),
}

/// Re-parse and load the real patched file.
pub async fn validate_live_file(
    toolchain: &ToolchainConfig,
    path: &Path,
) -> Result<(), PostValidateError> {
    let bound = Duration::from_secs(toolchain.sandbox_timeout_secs);

    let check = run_bounded(&toolchain.check_cmd, path, bound)
        .await
        .map_err(map_exec)?;
    if !check.status.success() {
        return Err(PostValidateError::Syntax(trimmed(&check.stderr)));
    }

    let load = run_bounded(&toolchain.load_cmd, path, bound)
        .await
        .map_err(map_exec)?;
    if !load.status.success() {
        return Err(PostValidateError::Load(trimmed(&load.stderr)));
    }

    info!(target: "autopatch::validate", path = %path.display(), "post-apply validation passed");
    Ok(())
}

fn map_exec(e: ExecError) -> PostValidateError {
    match e {
        ExecError::Timeout => PostValidateError::Timeout,
        ExecError::Spawn(e) => PostValidateError::Io(e.to_string()),
        ExecError::EmptyCommand => PostValidateError::Io("empty toolchain command".to_string()),
    }
}

fn trimmed(stderr: &[u8]) -> String {
    lossy(stderr).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(check: &[&str], load: &[&str]) -> ToolchainConfig {
        ToolchainConfig {
            check_cmd: check.iter().map(|s| s.to_string()).collect(),
            run_cmd: load.iter().map(|s| s.to_string()).collect(),
            load_cmd: load.iter().map(|s| s.to_string()).collect(),
            sandbox_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn valid_unit_passes_both_phases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.sh");
        std::fs::write(&path, "echo loaded\n").unwrap();
        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"]);
        assert!(validate_live_file(&tc, &path).await.is_ok());
    }

    #[tokio::test]
    async fn broken_syntax_is_distinguished_from_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tc = toolchain(&["/bin/sh", "-n"], &["/bin/sh"]);

        let bad_syntax = dir.path().join("bad.sh");
        std::fs::write(&bad_syntax, "if then fi (((\n").unwrap();
        assert!(matches!(
            validate_live_file(&tc, &bad_syntax).await,
            Err(PostValidateError::Syntax(_))
        ));

        let bad_load = dir.path().join("crash.sh");
        std::fs::write(&bad_load, "exit 7\n").unwrap();
        assert!(matches!(
            validate_live_file(&tc, &bad_load).await,
            Err(PostValidateError::Load(_))
        ));
    }
}
