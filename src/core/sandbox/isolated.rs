//! Isolated mode: the snippet runs as a separate OS process. Process
//! isolation is the boundary here, so no validation or namespace
//! restriction applies, and a timeout kills the child.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::SandboxError;

pub(super) struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub success: bool,
}

/// Writes `code` to a temporary script and runs `interpreter <script>`.
pub(super) async fn run(code: &str, interpreter: &[String], timeout: Duration) -> Result<ProcessOutput, SandboxError> {
    let Some((program, args)) = interpreter.split_first() else {
        return Err(SandboxError::Isolated("no interpreter configured".to_string()));
    };

    let mut script = tempfile::Builder::new()
        .prefix("deskmate_")
        .suffix(".py")
        .tempfile()
        .map_err(|err| SandboxError::Isolated(err.to_string()))?;
    script
        .write_all(code.as_bytes())
        .and_then(|_| script.flush())
        .map_err(|err| SandboxError::Isolated(err.to_string()))?;

    debug!(program = %program, script = %script.path().display(), "spawning isolated run");
    let child = Command::new(program)
        .args(args)
        .arg(script.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| SandboxError::Isolated(err.to_string()))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(SandboxError::Isolated(err.to_string())),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "isolated run timed out; process killed");
            return Err(SandboxError::IsolatedTimeout);
        }
    };

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
        success: output.status.success(),
    })
}
