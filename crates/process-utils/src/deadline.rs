use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure to run an external tool to completion.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exceeded {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("I/O error while waiting for {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `cmd` to completion, killing it when `timeout` elapses or `cancel`
/// fires.
///
/// Stdout and stderr are captured; stdin is closed. The child is always
/// reaped before this returns, so no process outlives the call.
pub async fn run_with_deadline(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program, pid = ?child.id(), "spawned process");

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain both pipes while waiting so a chatty child never blocks on a
    // full pipe buffer.
    let outcome = {
        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                if let Some(s) = stdout.as_mut() {
                    s.read_to_end(&mut out).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let read_err = async {
                if let Some(s) = stderr.as_mut() {
                    s.read_to_end(&mut err).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (r1, r2) = tokio::join!(read_out, read_err);
            r1?;
            r2?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        tokio::select! {
            res = collect => Outcome::Finished(res),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        }
    };

    match outcome {
        Outcome::Finished(Ok((status, stdout, stderr))) => Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            elapsed: start.elapsed(),
        }),
        Outcome::Finished(Err(source)) => {
            let _ = kill_and_reap(&mut child, &program).await;
            Err(ProcessError::Io { program, source })
        }
        Outcome::TimedOut => {
            warn!(program = %program, ?timeout, "process timed out, killing");
            kill_and_reap(&mut child, &program).await?;
            Err(ProcessError::Timeout { program, timeout })
        }
        Outcome::Cancelled => {
            warn!(program = %program, "process cancelled, killing");
            kill_and_reap(&mut child, &program).await?;
            Err(ProcessError::Cancelled { program })
        }
    }
}

enum Outcome {
    Finished(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

async fn kill_and_reap(
    child: &mut tokio::process::Child,
    program: &str,
) -> Result<(), ProcessError> {
    if let Err(e) = child.kill().await {
        // Already exited.
        if e.kind() != std::io::ErrorKind::InvalidInput {
            return Err(ProcessError::Io {
                program: program.to_string(),
                source: e,
            });
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tokio_command;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let mut cmd = tokio_command("sh");
        cmd.args(["-c", "echo hello; echo oops >&2"]);
        let out = run_with_deadline(cmd, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy().trim(), "hello");
        assert_eq!(out.stderr_lossy().trim(), "oops");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let mut cmd = tokio_command("sleep");
        cmd.arg("30");
        let err = run_with_deadline(cmd, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn kills_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut cmd = tokio_command("sleep");
        cmd.arg("30");
        let err = run_with_deadline(cmd, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let cmd = tokio_command("definitely-not-a-real-binary-xyz");
        let err = run_with_deadline(cmd, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
