//! Bounded external-command execution shared by sandbox and validation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

pub(crate) enum ExecError {
    EmptyCommand,
    Timeout,
    Spawn(std::io::Error),
}

/// Run `cmd` with the target file appended as the final argument, capturing
/// output. The child is killed if the wall-clock bound elapses
/// (`kill_on_drop` — cancelling the future reaps the process).
pub(crate) async fn run_bounded(
    cmd: &[String],
    file: &Path,
    bound: Duration,
) -> Result<std::process::Output, ExecError> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(ExecError::EmptyCommand);
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(bound, command.output()).await {
        Err(_) => Err(ExecError::Timeout),
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ExecError::Spawn(e)),
    }
}

pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
