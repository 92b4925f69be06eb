//! Host shell executor.

use std::process::Stdio;

use async_trait::async_trait;
use deployx_core::Result;
use deployx_core::executor::{CommandExecutor, ExecOutcome, ExecRequest, OutputSink};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecutorError;

/// Runs job commands with `sh -c` directly on the host.
///
/// The child is spawned with `kill_on_drop`, so dropping the future returned
/// by [`CommandExecutor::run`] kills the shell.
pub struct ProcessExecutor {
    shell: String,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different POSIX shell, e.g. `bash`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, request: ExecRequest, output: OutputSink) -> Result<ExecOutcome> {
        tokio::fs::create_dir_all(&request.working_dir)
            .await
            .map_err(ExecutorError::from)?;

        info!(
            job_id = %request.job_id,
            dir = %request.working_dir.display(),
            "Spawning process"
        );

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::from)?;

        let stdout = forward_lines(child.stdout.take(), output.clone());
        let stderr = forward_lines(child.stderr.take(), output);
        let (status, _, _) = tokio::join!(child.wait(), stdout, stderr);
        let status = status.map_err(ExecutorError::from)?;

        debug!(job_id = %request.job_id, status = %status, "Process exited");
        Ok(ExecOutcome {
            exit_code: status.code(),
        })
    }
}

/// Copy a child stream to the sink one line at a time. Invalid UTF-8 is
/// replaced rather than ending the stream.
async fn forward_lines<R>(reader: Option<R>, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}
