//! Running external tools with hard timeouts.
//!
//! Every subprocess the daemon drives (makemkvcon, eject, the encoder) goes
//! through [`run_tool`], which streams stdout line by line to a callback,
//! captures stderr for diagnostics and kills the child when the timeout
//! expires. A timeout is reported as a failure like any other.

use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

/// Failure of an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The binary could not be started at all.
    #[error("{tool} could not be started: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("{tool} exited with status {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The process outlived its timeout and was killed.
    #[error("{tool} timed out after {timeout_secs}s")]
    TimedOut {
        tool: String,
        timeout_secs: u64,
        stderr: String,
    },

    /// The process succeeded but its output was unusable.
    #[error("{tool} produced no usable output: {detail}")]
    EmptyOutput {
        tool: String,
        detail: String,
        stderr: String,
    },

    /// The process reported a failure on its own output channel.
    #[error("{tool} reported failure: {message}")]
    Reported {
        tool: String,
        message: String,
        stderr: String,
    },

    #[error("I/O error talking to {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub fn tool(&self) -> &str {
        match self {
            ToolError::Spawn { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::TimedOut { tool, .. }
            | ToolError::EmptyOutput { tool, .. }
            | ToolError::Reported { tool, .. }
            | ToolError::Io { tool, .. } => tool,
        }
    }

    /// Captured stderr of the failed process (empty if none was collected).
    pub fn stderr(&self) -> &str {
        match self {
            ToolError::Failed { stderr, .. }
            | ToolError::TimedOut { stderr, .. }
            | ToolError::EmptyOutput { stderr, .. }
            | ToolError::Reported { stderr, .. } => stderr,
            ToolError::Spawn { .. } | ToolError::Io { .. } => "",
        }
    }
}

/// Output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Name used for a command in errors and logs.
pub fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().to_string()
}

/// How long to wait for stderr after the child is gone. Grandchildren can
/// keep the pipe open indefinitely.
const STDERR_GRACE: Duration = Duration::from_secs(2);

async fn collect_stderr(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(STDERR_GRACE, task).await {
        Ok(Ok(buf)) => buf.trim().to_string(),
        _ => String::new(),
    }
}

/// Runs `cmd` to completion, calling `on_line` for every stdout line.
///
/// With `limit` set the child is killed once it expires and
/// [`ToolError::TimedOut`] is returned. Nonzero exits become
/// [`ToolError::Failed`] carrying the captured stderr.
pub async fn run_tool<F>(
    mut cmd: Command,
    limit: Option<Duration>,
    mut on_line: F,
) -> Result<ToolOutput, ToolError>
where
    F: FnMut(&str) + Send,
{
    let tool = program_name(&cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool = %tool, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "Starting tool");

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.clone(),
        source,
    })?;

    let missing_pipe = |name: &str| ToolError::Io {
        tool: tool.clone(),
        source: io::Error::new(io::ErrorKind::Other, format!("{} was not captured", name)),
    };
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut captured = Vec::new();
    let run = async {
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
            captured.push(line);
        }
        child.wait().await
    };

    let outcome = match limit {
        Some(limit) => tokio::time::timeout(limit, run).await.ok(),
        None => Some(run.await),
    };

    let status = match outcome {
        Some(result) => result,
        None => {
            let _ = child.kill().await;
            return Err(ToolError::TimedOut {
                tool,
                timeout_secs: limit.map(|l| l.as_secs()).unwrap_or_default(),
                stderr: collect_stderr(stderr_task).await,
            });
        }
    };

    let stderr = collect_stderr(stderr_task).await;
    let status = status.map_err(|source| ToolError::Io {
        tool: tool.clone(),
        source,
    })?;

    if !status.success() {
        return Err(ToolError::Failed {
            tool,
            code: status.code(),
            stderr,
        });
    }

    Ok(ToolOutput {
        stdout: captured,
        stderr,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_tool_streams_stdout_lines() {
        let mut seen = Vec::new();
        let output = run_tool(
            shell("printf 'TCOUNT:1\\nTINFO:0,9,0,\"0:01:00\"\\n'"),
            Some(Duration::from_secs(10)),
            |line| seen.push(line.to_string()),
        )
        .await
        .expect("tool should succeed");

        assert_eq!(seen, vec!["TCOUNT:1", "TINFO:0,9,0,\"0:01:00\""]);
        assert_eq!(output.stdout, seen);
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let err = run_tool(
            shell("echo 'Disc read error' >&2; exit 1"),
            Some(Duration::from_secs(10)),
            |_| {},
        )
        .await
        .expect_err("tool should fail");

        match &err {
            ToolError::Failed { code, stderr, tool } => {
                assert_eq!(*code, Some(1));
                assert_eq!(stderr, "Disc read error");
                assert_eq!(tool, "sh");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(err.stderr(), "Disc read error");
        assert!(err.to_string().contains("Disc read error"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let err = run_tool(shell("exec sleep 5"), Some(Duration::from_millis(200)), |_| {})
            .await
            .expect_err("tool should time out");

        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cmd = Command::new("/nonexistent/spindle-test-binary");
        let err = run_tool(cmd, None, |_| {}).await.expect_err("spawn should fail");
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert_eq!(err.stderr(), "");
    }
}
