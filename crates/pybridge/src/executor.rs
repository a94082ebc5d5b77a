//! Child-process execution with cancellation, timeouts and tree kills.
//!
//! Both [`CommandRunner::run`] and [`CommandRunner::start`] go through one
//! launch primitive. A reaper task owns the child and waits on exit,
//! cancellation and the timeout at once. Whichever fires first decides the
//! [`ProcessExit`] published to every [`RunningProcess`] watcher.

use async_trait::async_trait;
use pybridge_core::{
    BridgeError, CommandRequest, ExecutionResult, ProcessControl, ProcessId, Result,
    TerminationResult, decode_output, stream_lines,
};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for draining captured pipes once the child is gone. A
/// grandchild that inherited the pipe can otherwise hold it open forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-line callbacks for a streaming process
#[derive(Clone, Default)]
pub struct OutputSinks {
    pub on_stdout: Option<LineCallback>,
    pub on_stderr: Option<LineCallback>,
}

impl OutputSinks {
    pub fn new(
        on_stdout: impl Fn(&str) + Send + Sync + 'static,
        on_stderr: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_stdout: Some(Arc::new(on_stdout)),
            on_stderr: Some(Arc::new(on_stderr)),
        }
    }

    /// Forward every line to `tracing` under the given target name
    pub fn logging(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let err_name = name.clone();
        Self::new(
            move |line| debug!(process = %name, "stdout: {line}"),
            move |line| warn!(process = %err_name, "stderr: {line}"),
        )
    }
}

/// How a supervised child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    Cancelled,
    TimedOut(Duration),
    /// Waiting on the child failed. The tree was killed anyway.
    WaitFailed(std::io::ErrorKind),
}

impl ProcessExit {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessExit::Exited(status) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }

    /// The error a caller waiting for completion sees, `None` for a normal exit
    pub fn error(&self) -> Option<BridgeError> {
        match *self {
            ProcessExit::Exited(_) => None,
            ProcessExit::Cancelled => Some(BridgeError::Cancelled),
            ProcessExit::TimedOut(after) => Some(BridgeError::Timeout(after)),
            ProcessExit::WaitFailed(kind) => Some(BridgeError::Io(std::io::Error::new(
                kind,
                "failed to wait for child process",
            ))),
        }
    }
}

/// Executes external programs. Mocked in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture both streams. A non-zero exit code is
    /// returned in the result, never as an error.
    async fn run(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Spawn and return immediately, streaming lines to `sinks`. Cancellation or
    /// the request timeout kills the tree while the process is still running.
    async fn start(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
        sinks: OutputSinks,
    ) -> Result<RunningProcess>;
}

/// Handle to a child spawned by [`CommandRunner::start`]
pub struct RunningProcess {
    pid: ProcessId,
    program: String,
    exit: watch::Receiver<Option<ProcessExit>>,
    control: Arc<dyn ProcessControl>,
}

impl std::fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcess")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl RunningProcess {
    pub fn new(
        pid: ProcessId,
        program: impl Into<String>,
        exit: watch::Receiver<Option<ProcessExit>>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            pid,
            program: program.into(),
            exit,
            control,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait up to `timeout` for the reaper to observe exit. Returns whether it did.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut exit = self.exit.clone();
        match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => true,
            // Sender dropped without publishing: the reaper itself is gone
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    pub async fn kill_tree(&self) -> TerminationResult {
        if self.has_exited() {
            return TerminationResult::ProcessNotFound;
        }
        self.control.terminate_tree(self.pid).await
    }

    /// Synchronous best-effort kill for `Drop` paths
    pub fn emergency_kill(&self) {
        if !self.has_exited() {
            self.control.emergency_kill(self.pid);
        }
    }
}

enum OutputMode {
    Capture,
    Stream(OutputSinks),
}

struct Captured {
    exit: ProcessExit,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Real [`CommandRunner`] backed by `tokio::process`
#[derive(Clone)]
pub struct ProcessExecutor {
    control: Arc<dyn ProcessControl>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::with_control(crate::platform::process_control())
    }

    pub fn with_control(control: Arc<dyn ProcessControl>) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &Arc<dyn ProcessControl> {
        &self.control
    }

    fn spawn_child(&self, request: &CommandRequest) -> Result<Child> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.control.prepare(&mut command);
        command.spawn().map_err(|source| BridgeError::LaunchFailed {
            program: request.program.clone(),
            source,
        })
    }

    async fn launch(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
        mode: OutputMode,
    ) -> Result<(RunningProcess, JoinHandle<Captured>)> {
        let mut child = self.spawn_child(request)?;
        let Some(pid) = child.id() else {
            return Err(BridgeError::LaunchFailed {
                program: request.program.clone(),
                source: std::io::Error::other("process exited before its PID was read"),
            });
        };
        info!(pid = pid, command = %request, "Spawned process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let readers = match mode {
            OutputMode::Capture => Some((capture(stdout), capture(stderr))),
            OutputMode::Stream(sinks) => {
                forward(stdout, sinks.on_stdout);
                forward(stderr, sinks.on_stderr);
                None
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let control = self.control.clone();
        let cancel = cancel.clone();
        let timeout = request.timeout;
        let reaper = tokio::spawn(async move {
            let exit = supervise(child, pid, control.as_ref(), &cancel, timeout).await;
            let (stdout, stderr) = match readers {
                Some((out, err)) => (drain(out).await, drain(err).await),
                None => (Vec::new(), Vec::new()),
            };
            let _ = exit_tx.send(Some(exit));
            Captured {
                exit,
                stdout,
                stderr,
            }
        });

        let process = RunningProcess::new(pid, request.program.clone(), exit_rx, self.control.clone());
        Ok((process, reaper))
    }
}

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let (process, reaper) = self.launch(&request, cancel, OutputMode::Capture).await?;
        let captured = reaper
            .await
            .map_err(|e| anyhow::anyhow!("process reaper for PID {} failed: {e}", process.pid()))?;

        if let Some(error) = captured.exit.error() {
            return Err(error);
        }
        let result = ExecutionResult::new(
            captured.exit.exit_code().unwrap_or(-1),
            decode_output(&captured.stdout, request.encoding),
            decode_output(&captured.stderr, request.encoding),
        );
        debug!(pid = process.pid(), exit_code = result.exit_code, command = %request, "Process finished");
        Ok(result)
    }

    async fn start(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
        sinks: OutputSinks,
    ) -> Result<RunningProcess> {
        let (process, _reaper) = self
            .launch(&request, cancel, OutputMode::Stream(sinks))
            .await?;
        Ok(process)
    }
}

/// Wait for the first of exit, cancellation and timeout. Kills the tree on the
/// latter two and always reaps the child.
async fn supervise(
    mut child: Child,
    pid: ProcessId,
    control: &dyn ProcessControl,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> ProcessExit {
    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => return ProcessExit::Exited(status),
            Err(e) => {
                warn!(pid = pid, error = %e, "Failed to wait for process, killing process tree");
                ProcessExit::WaitFailed(e.kind())
            }
        },
        _ = cancel.cancelled() => {
            info!(pid = pid, "Cancellation requested, killing process tree");
            ProcessExit::Cancelled
        }
        _ = deadline => {
            warn!(pid = pid, timeout = ?timeout, "Process timed out, killing process tree");
            ProcessExit::TimedOut(timeout.unwrap_or_default())
        }
    };

    let result = control.terminate_tree(pid).await;
    if !result.is_gone() {
        warn!(pid = pid, ?result, "Process tree termination incomplete");
    }
    if let Err(e) = child.kill().await {
        debug!(pid = pid, error = %e, "Child already reaped");
    }
    exit
}

fn capture<R>(io: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    io.map(|mut io| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = io.read_to_end(&mut buf).await {
                debug!(error = %e, "Output pipe closed with error");
            }
            buf
        })
    })
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            Vec::new()
        }
        Err(_) => {
            warn!("Output pipe still open after process exit, dropping remainder");
            abort.abort();
            Vec::new()
        }
    }
}

fn forward<R>(io: Option<R>, sink: Option<LineCallback>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(io) = io else { return };
    tokio::spawn(async move {
        let result = stream_lines(io, |line| {
            if let Some(sink) = &sink {
                sink(&line);
            }
        })
        .await;
        if let Err(e) = result {
            debug!(error = %e, "Output stream closed with error");
        }
    });
}
