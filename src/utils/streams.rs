// src/utils/streams.rs
use std::collections::VecDeque;
use std::fs::File;
use std::process::{ExitStatus, Stdio};
use anyhow::{anyhow, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::config::defs::{PipelineError, STDERR_TAIL_LINES};
use crate::utils::command::ToolInvocation;


/// One unit of data moving between stages: a single text line, terminator included.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutput {
    Bytes(Vec<u8>),
}


/// A spawned external tool together with the task draining its stderr.
pub struct RunningTool {
    pub tool: String,
    pub child: Child,
    stderr_task: Option<JoinHandle<Vec<String>>>,
}

/// How a tool ended, with the last lines it wrote to stderr.
#[derive(Debug)]
pub struct ExitReport {
    pub tool: String,
    pub status: ExitStatus,
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    /// True when the tool exited on its own with a non-zero code, as opposed
    /// to being killed by a signal (typically SIGPIPE after a downstream failure).
    pub fn failed_with_code(&self) -> bool {
        !self.status.success() && self.status.code().is_some()
    }

    pub fn into_result(self) -> Result<(), PipelineError> {
        if self.status.success() {
            Ok(())
        } else {
            Err(PipelineError::ToolFailed {
                tool: self.tool,
                status: self.status.to_string(),
                stderr_tail: self.stderr_tail,
            })
        }
    }
}

impl RunningTool {
    /// Waits for exit. Never fails on a non-zero status; see [`ExitReport::into_result`].
    pub async fn wait(mut self) -> Result<ExitReport, PipelineError> {
        let status = self.child.wait().await.map_err(|e| PipelineError::ToolExecution {
            tool: self.tool.clone(),
            error: format!("failed to wait: {}", e),
        })?;
        let stderr_tail = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        debug!("{} finished with {}", self.tool, status);
        Ok(ExitReport { tool: self.tool, status, stderr_tail })
    }
}


/// Spawns an external tool.
///
/// # Arguments
///
/// * `invocation` - Program, arguments and optional stdout redirect file.
/// * `stdin_piped` - Open a pipe for `stream_to_cmd`; otherwise stdin is closed.
/// * `stdout_piped` - Open a pipe for `parse_child_output`. Ignored when stdout is redirected to a file.
///
/// # Returns
/// RunningTool, or ToolNotFound / ToolExecution / IOError on spawn failure.
pub fn spawn_tool(
    invocation: &ToolInvocation,
    stdin_piped: bool,
    stdout_piped: bool,
) -> Result<RunningTool, PipelineError> {
    let stdout = match &invocation.stdout {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| PipelineError::IOError(format!("cannot create {}: {}", path.display(), e)))?;
            Stdio::from(file)
        }
        None if stdout_piped => Stdio::piped(),
        None => Stdio::inherit(),
    };
    let stdin = if stdin_piped { Stdio::piped() } else { Stdio::null() };

    debug!("Spawning: {}", invocation.command_line());
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::ToolNotFound {
                    tool: invocation.tool.clone(),
                    error: format!("{}: {}", invocation.program.display(), e),
                }
            } else {
                PipelineError::ToolExecution {
                    tool: invocation.tool.clone(),
                    error: format!("failed to spawn: {}", e),
                }
            }
        })?;

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| spawn_stderr_collector(stderr, invocation.tool.clone()));

    Ok(RunningTool {
        tool: invocation.tool.clone(),
        child,
        stderr_task,
    })
}


/// Forwards a tool's stderr to the debug log, keeping the last lines for error reports.
fn spawn_stderr_collector<R>(stderr: R, tool: String) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", tool, line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}


/// Streams a child's stdout line by line into a channel.
///
/// Each item is one line with its `\n`; a final unterminated line gets one added.
/// The task stops early, dropping the pipe, if the receiver goes away.
///
/// # Arguments
///
/// * `child` - Child spawned with stdout piped.
/// * `buffer_size` - Channel capacity in lines.
///
/// # Returns
/// Receiver of lines and the reader task handle.
pub fn parse_child_output(
    child: &mut Child,
    buffer_size: usize,
) -> Result<(mpsc::Receiver<ParseOutput>, JoinHandle<Result<()>>)> {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not piped"))?;
    Ok((rx, tokio::spawn(pump_lines(stdout, tx))))
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<ParseOutput>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        if tx.send(ParseOutput::Bytes(line)).await.is_err() {
            // Downstream closed; its own failure is reported by the caller.
            break;
        }
    }
    Ok(())
}


/// Writes a line stream into a child's stdin, closing it at the end of the stream.
///
/// # Returns
/// Writer task handle. A write failure (e.g. a broken pipe) is a ToolExecution error.
pub fn stream_to_cmd(
    mut rx: mpsc::Receiver<ParseOutput>,
    child: &mut Child,
    tool: &str,
) -> Result<JoinHandle<Result<(), PipelineError>>, PipelineError> {
    let mut stdin = child.stdin.take().ok_or_else(|| PipelineError::ToolExecution {
        tool: tool.to_string(),
        error: "stdin not piped".to_string(),
    })?;
    let tool = tool.to_string();
    Ok(tokio::spawn(async move {
        while let Some(ParseOutput::Bytes(bytes)) = rx.recv().await {
            stdin.write_all(&bytes).await.map_err(|e| PipelineError::ToolExecution {
                tool: tool.clone(),
                error: format!("write to stdin failed: {}", e),
            })?;
        }
        stdin.shutdown().await.map_err(|e| PipelineError::ToolExecution {
            tool: tool.clone(),
            error: format!("closing stdin failed: {}", e),
        })?;
        Ok(())
    }))
}
