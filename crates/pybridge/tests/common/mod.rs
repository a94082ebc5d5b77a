#![allow(dead_code)]

use async_trait::async_trait;
use pybridge::{
    CommandRequest, CommandRunner, ExecutionResult, OutputSinks, ProcessControl, ProcessExecutor,
    ProcessExit, ProcessId, PythonBridge, Result, RunningProcess, TerminationResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const INFO_JSON: &str = r#"{"default_prefix":"/opt/conda","envs":["/opt/conda/envs/foo"]}"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

type Responder = Box<dyn Fn(&CommandRequest) -> Result<ExecutionResult> + Send + Sync>;

/// Records every request. `run` answers through the responder, `start` either
/// spawns for real or hands back an already-exited process.
pub struct MockRunner {
    responder: Responder,
    executor: Option<ProcessExecutor>,
    control: Arc<RecordingControl>,
    calls: Mutex<Vec<CommandRequest>>,
    started: Mutex<Vec<CommandRequest>>,
}

impl MockRunner {
    pub fn new(
        responder: impl Fn(&CommandRequest) -> Result<ExecutionResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            executor: None,
            control: Arc::new(RecordingControl::default()),
            calls: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Answer every `run` with the same output
    pub fn answering(exit_code: i32, stdout: &'static str, stderr: &'static str) -> Self {
        Self::new(move |_| Ok(ExecutionResult::new(exit_code, stdout, stderr)))
    }

    /// Spawn real processes from `start`
    pub fn spawning(mut self) -> Self {
        self.executor = Some(ProcessExecutor::new());
        self
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<CommandRequest> {
        self.started.lock().unwrap().clone()
    }

    pub fn control(&self) -> &Arc<RecordingControl> {
        &self.control
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(request.clone());
        if cancel.is_cancelled() {
            return Err(pybridge::BridgeError::Cancelled);
        }
        (self.responder)(&request)
    }

    async fn start(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
        sinks: OutputSinks,
    ) -> Result<RunningProcess> {
        self.started.lock().unwrap().push(request.clone());
        match &self.executor {
            Some(executor) => executor.start(request, cancel, sinks).await,
            None => {
                let (_tx, rx) = watch::channel(Some(ProcessExit::Cancelled));
                Ok(RunningProcess::new(
                    4_000_000,
                    request.program,
                    rx,
                    self.control.clone(),
                ))
            }
        }
    }
}

/// Process control that only counts what it was asked to do
#[derive(Default)]
pub struct RecordingControl {
    terminations: AtomicUsize,
    emergency_kills: AtomicUsize,
}

impl RecordingControl {
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn emergency_kills(&self) -> usize {
        self.emergency_kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for RecordingControl {
    fn platform_name(&self) -> &'static str {
        "mock"
    }

    fn prepare(&self, _command: &mut tokio::process::Command) {}

    fn is_alive(&self, _pid: ProcessId) -> bool {
        false
    }

    async fn find_child_processes(&self, _pid: ProcessId) -> Vec<ProcessId> {
        Vec::new()
    }

    async fn terminate_tree(&self, _root_pid: ProcessId) -> TerminationResult {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        TerminationResult::Success
    }

    fn emergency_kill(&self, _pid: ProcessId) {
        self.emergency_kills.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn bridge(runner: &Arc<MockRunner>, compat: bool) -> PythonBridge {
    bridge_with(runner, compat, fast_options())
}

pub fn bridge_with(
    runner: &Arc<MockRunner>,
    compat: bool,
    options: pybridge::BridgeOptions,
) -> PythonBridge {
    PythonBridge::builder()
        .runner(runner.clone())
        .options(options)
        .compat_supported(compat)
        .build()
        .unwrap()
}

/// Defaults with retry delays short enough for tests
pub fn fast_options() -> pybridge::BridgeOptions {
    pybridge::BridgeOptions {
        warmup_retry_delay_ms: 10,
        banner_retry_delay_ms: 10,
        ..Default::default()
    }
}

/// Create an empty file, with parent directories
pub fn touch(path: &std::path::Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, "").unwrap();
}
