//! Birth-to-death management of one assistant process.
//!
//! A [`ProcessHandle`] is owned by exactly one turn. Its stdin is shared
//! through a cloneable [`StdinWriter`] so control messages can reach it while
//! the turn's pump reads stdout. Shutdown is idempotent and always ends with
//! the child reaped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::user_message;
use crate::config::{AssistantSection, PermissionMode};
use crate::errors::OrchestratorError;

/// Bytes of stderr kept for error reports.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(500);

const STDIN_SHUTDOWN_WAIT: Duration = Duration::from_millis(200);

/// Everything needed to start the assistant for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Protocol flags, then turn-specific flags, then configured extras.
    pub fn for_turn(
        settings: &AssistantSection,
        model: &str,
        resume_token: Option<&str>,
        files: &[PathBuf],
    ) -> Self {
        let mut args: Vec<String> = [
            "--print",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match settings.permission_mode {
            PermissionMode::Bypass => args.push("--dangerously-skip-permissions".to_string()),
            PermissionMode::Prompt => {
                args.push("--permission-prompt-tool".to_string());
                args.push("stdio".to_string());
            }
        }

        args.push("--model".to_string());
        args.push(model.to_string());

        if let Some(token) = resume_token {
            args.push("--resume".to_string());
            args.push(token.to_string());
        }
        for file in files {
            args.push("--file".to_string());
            args.push(file.display().to_string());
        }
        args.extend(settings.extra_args.iter().cloned());

        Self {
            program: settings.command.clone(),
            args,
            working_dir: settings.working_dir.clone(),
        }
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes queued for the stdin task before senders wait.
const STDIN_QUEUE: usize = 16;

/// Default limit on one stdin write, including time spent queued.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

struct WriteRequest {
    line: Vec<u8>,
    done: oneshot::Sender<std::io::Result<()>>,
}

/// Shared, closable handle to a process's stdin.
///
/// Every write is one JSON record followed by a newline, flushed immediately.
/// A dedicated task owns the pipe and performs writes in queue order, so
/// lines never interleave. Closing never waits on a blocked write: the task
/// drops the pipe as soon as the writer is closed.
#[derive(Clone)]
pub struct StdinWriter {
    queue: mpsc::Sender<WriteRequest>,
    closed: CancellationToken,
    write_timeout: Duration,
}

impl std::fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinWriter")
            .field("closed", &self.closed.is_cancelled())
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl StdinWriter {
    /// Start the writer task for `writer`. Must be called inside a runtime.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, requests) = mpsc::channel(STDIN_QUEUE);
        let closed = CancellationToken::new();
        tokio::spawn(run_stdin_task(Box::new(writer), requests, closed.clone()));
        Self {
            queue,
            closed,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Write one record. Fails with [`OrchestratorError::StdinWriteTimeout`]
    /// if the process does not accept it in time, and with
    /// [`OrchestratorError::StdinClosed`] once the writer is closed.
    pub async fn send(&self, message: &Value) -> Result<(), OrchestratorError> {
        if self.closed.is_cancelled() {
            return Err(OrchestratorError::StdinClosed);
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let (done, written) = oneshot::channel();
        let request = WriteRequest { line, done };
        let write = async {
            self.queue
                .send(request)
                .await
                .map_err(|_| OrchestratorError::StdinClosed)?;
            written
                .await
                .map_err(|_| OrchestratorError::StdinClosed)?
                .map_err(OrchestratorError::StdinWrite)
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(OrchestratorError::StdinClosed),
            result = tokio::time::timeout(self.write_timeout, write) => match result {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::StdinWriteTimeout {
                    secs: self.write_timeout.as_secs(),
                }),
            },
        }
    }

    /// Close stdin. Safe to call more than once; pending writes are dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

async fn run_stdin_task(
    mut writer: BoxedWriter,
    mut requests: mpsc::Receiver<WriteRequest>,
    closed: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = write_line(&mut writer, &request.line) => result,
        };
        let failed = result.is_err();
        let _ = request.done.send(result);
        if failed {
            // A broken pipe will not heal; stop accepting writes
            closed.cancel();
            break;
        }
    }

    if let Ok(Err(e)) = tokio::time::timeout(STDIN_SHUTDOWN_WAIT, writer.shutdown()).await {
        debug!(error = %e, "error while closing assistant stdin");
    }
}

async fn write_line(writer: &mut BoxedWriter, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited on its own
    Natural,
    /// Exited after SIGTERM
    Terminated,
    /// Did not exit within the terminate grace and was killed
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub termination: Termination,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, termination: Termination) -> Self {
        Self {
            code: status.code(),
            termination,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Natural && self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.termination, self.code) {
            (Termination::Natural, Some(code)) => format!("exit code {}", code),
            (Termination::Natural, None) => "terminated by signal".to_string(),
            (Termination::Terminated, _) => "terminated".to_string(),
            (Termination::Killed, _) => "killed".to_string(),
        }
    }
}

/// Why the process is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The turn finished; give the process time to exit on its own
    Completed,
    /// Timeout, output cap or caller disconnect; terminate right away
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownGrace {
    pub exit: Duration,
    pub terminate: Duration,
}

enum ProcessState {
    Running,
    Closed(ExitInfo),
}

/// Exclusively owned handle to one live assistant process.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    stdin: StdinWriter,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    state: ProcessState,
    session_token: Option<String>,
    grace: ShutdownGrace,
}

impl ProcessHandle {
    /// Spawn the process with all three streams piped.
    pub fn spawn(spec: &LaunchSpec, grace: ShutdownGrace) -> Result<Self, OrchestratorError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| OrchestratorError::SpawnFailed {
            command: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("assistant stdin was not piped"))?;
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, pid, stderr_tail.clone())));

        info!(pid, command = %spec.display(), "spawned assistant process");

        Ok(Self {
            child,
            pid,
            stdin: StdinWriter::new(stdin),
            stdout,
            stderr_tail,
            stderr_task,
            state: ProcessState::Running,
            session_token: None,
            grace,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stdin(&self) -> StdinWriter {
        self.stdin.clone()
    }

    /// Limit for each stdin write. Applies to writers handed out afterwards.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.stdin = self.stdin.clone().with_write_timeout(timeout);
    }

    /// Stdout can be taken once, by the reader.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Write the opening user message.
    pub async fn send_user_message(&self, content: &str) -> Result<(), OrchestratorError> {
        self.stdin.send(&user_message(content)).await
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn set_session_token(&mut self, token: impl Into<String>) {
        self.session_token = Some(token.into());
    }

    /// Last bytes the process wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.trim().to_string())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ProcessState::Closed(_))
    }

    /// Graceful shutdown after a completed turn.
    pub async fn close(&mut self) -> ExitInfo {
        self.shutdown(ShutdownReason::Completed).await
    }

    /// Immediate shutdown for an aborted turn.
    pub async fn abort(&mut self) -> ExitInfo {
        self.shutdown(ShutdownReason::Aborted).await
    }

    /// Close stdin, wait for exit, escalate to SIGTERM and then SIGKILL.
    ///
    /// Idempotent: later calls return the first call's result without
    /// signalling the process again.
    pub async fn shutdown(&mut self, reason: ShutdownReason) -> ExitInfo {
        if let ProcessState::Closed(info) = &self.state {
            return info.clone();
        }

        self.stdin.close();

        let natural = match reason {
            ShutdownReason::Completed => {
                match tokio::time::timeout(self.grace.exit, self.child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(e)) => {
                        warn!(pid = self.pid, error = %e, "failed to wait for assistant process");
                        None
                    }
                    Err(_) => {
                        debug!(pid = self.pid, "assistant did not exit within grace period");
                        None
                    }
                }
            }
            ShutdownReason::Aborted => self.child.try_wait().ok().flatten(),
        };

        let exit = match natural {
            Some(status) => ExitInfo::from_status(status, Termination::Natural),
            None => self.terminate().await,
        };

        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_WAIT, task).await;
        }

        info!(pid = self.pid, ?reason, exit = %exit.describe(), "assistant process closed");
        self.state = ProcessState::Closed(exit.clone());
        exit
    }

    async fn terminate(&mut self) -> ExitInfo {
        self.send_sigterm();
        match tokio::time::timeout(self.grace.terminate, self.child.wait()).await {
            Ok(Ok(status)) => ExitInfo::from_status(status, Termination::Terminated),
            _ => {
                warn!(pid = self.pid, "assistant ignored SIGTERM; killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid = self.pid, error = %e, "failed to kill assistant process");
                }
                ExitInfo {
                    code: None,
                    termination: Termination::Killed,
                }
            }
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: signalling a child we spawned and have not yet reaped
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM delivery failed; process may have exited");
            }
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "failed to signal assistant process");
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>, tail: Arc<std::sync::Mutex<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!(pid, line = %line, "assistant stderr");
                }
                if let Ok(mut tail) = tail.lock() {
                    tail.push_str(line);
                    tail.push('\n');
                    trim_front(&mut tail, STDERR_TAIL_BYTES);
                }
            }
            Err(e) => {
                debug!(pid, error = %e, "stopped reading assistant stderr");
                break;
            }
        }
    }
}

/// Drop leading bytes so at most `max` remain, cutting on a char boundary.
fn trim_front(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
