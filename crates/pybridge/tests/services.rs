mod common;

use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use common::{MockRunner, bridge, init_tracing, touch};
use pybridge::platform::native_interpreter_path;
use pybridge::{
    BridgeError, CommandRequest, CommandRunner, Environment, ErrorKind, ExecutionContext,
    ExecutionResult, OutputSinks, ProcessControl, ProcessExit, ProcessId, PythonBridge, Result,
    RunningProcess, ServiceOptions, ServiceState, TerminationResult,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: tempfile::TempDir,
    env: Environment,
    script: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("envs").join("svc");
    touch(&native_interpreter_path(&prefix.to_string_lossy()));
    let script = dir.path().join("server.py");
    touch(&script);
    Fixture {
        env: Environment::new("svc", prefix.to_string_lossy()),
        script,
        _dir: dir,
    }
}

fn quick_options() -> ServiceOptions {
    ServiceOptions {
        health_check_timeout_ms: 2_000,
        health_check_retry_delay_ms: 50,
        force_kill_timeout_ms: 1_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_without_health_check_returns_after_spawn() {
    init_tracing();
    let fx = fixture();
    let runner = Arc::new(MockRunner::answering(0, "", ""));
    let bridge = bridge(&runner, false);
    let options = ServiceOptions {
        health_check_enabled: false,
        ..Default::default()
    };

    let handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(handle.state(), ServiceState::Running);
    assert!(handle.distro().is_none());
    let started = runner.started();
    assert_eq!(started.len(), 1);
    assert_eq!(
        started[0].args,
        vec![
            fx.script.to_string_lossy().into_owned(),
            "--port".to_string(),
            handle.port().to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
        ]
    );
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_stop_on_exited_process_with_free_port() {
    let fx = fixture();
    let runner = Arc::new(MockRunner::answering(0, "", ""));
    let bridge = bridge(&runner, false);
    let options = ServiceOptions {
        health_check_enabled: false,
        ..Default::default()
    };

    let mut handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert!(handle.has_exited());

    assert!(handle.stop(&options).await);
    assert_eq!(handle.state(), ServiceState::Stopped);
    assert!(!handle.was_force_killed());
    assert_eq!(runner.control().terminations(), 0);
}

#[tokio::test]
async fn test_start_rejects_missing_script_and_bad_options() {
    let fx = fixture();
    let runner = Arc::new(MockRunner::answering(0, "", ""));
    let bridge = bridge(&runner, false);

    let error = bridge
        .services()
        .start(
            &fx.script.with_file_name("missing.py"),
            Some(&fx.env),
            &ServiceOptions::default(),
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    let options = ServiceOptions {
        retry_count: 0,
        ..Default::default()
    };
    let error = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert!(runner.started().is_empty());
}

/// How the fake service behaves
#[derive(Clone, Copy)]
struct Behaviour {
    healthy: bool,
    honours_shutdown: bool,
}

/// Serves `/health` and `/shutdown` with axum on the `--port` of each started
/// request, standing in for a Python web service.
struct HttpServiceRunner {
    behaviour: Behaviour,
    control: Arc<KillSwitch>,
    started: Mutex<Vec<u16>>,
    health_hits: Arc<AtomicUsize>,
    shutdown_hits: Arc<AtomicUsize>,
}

impl HttpServiceRunner {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            control: Arc::new(KillSwitch::default()),
            started: Mutex::new(Vec::new()),
            health_hits: Arc::new(AtomicUsize::new(0)),
            shutdown_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn started(&self) -> Vec<u16> {
        self.started.lock().unwrap().clone()
    }
}

fn requested_port(request: &CommandRequest) -> u16 {
    let at = request.args.iter().position(|a| a == "--port").unwrap();
    request.args[at + 1].parse().unwrap()
}

#[async_trait]
impl CommandRunner for HttpServiceRunner {
    async fn run(
        &self,
        _request: CommandRequest,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        Ok(ExecutionResult::new(0, "", ""))
    }

    async fn start(
        &self,
        request: CommandRequest,
        _cancel: &CancellationToken,
        _sinks: OutputSinks,
    ) -> Result<RunningProcess> {
        let port = requested_port(&request);
        self.started.lock().unwrap().push(port);
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;

        let healthy = self.behaviour.healthy;
        let honours_shutdown = self.behaviour.honours_shutdown;
        let shutdown = Arc::new(Notify::new());
        let requested = shutdown.clone();
        let health_hits = self.health_hits.clone();
        let shutdown_hits = self.shutdown_hits.clone();
        let app = Router::new()
            .route(
                "/health",
                get(move || {
                    health_hits.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if healthy {
                            StatusCode::OK
                        } else {
                            StatusCode::SERVICE_UNAVAILABLE
                        }
                    }
                }),
            )
            .route(
                "/shutdown",
                get(move || {
                    shutdown_hits.fetch_add(1, Ordering::SeqCst);
                    let requested = requested.clone();
                    async move {
                        if honours_shutdown {
                            requested.notify_one();
                        }
                        "bye"
                    }
                }),
            );

        let (exit_tx, exit_rx) = watch::channel(None);
        let killed = self.control.token.clone();
        tokio::spawn(async move {
            let signal = async move {
                tokio::select! {
                    _ = shutdown.notified() => {}
                    _ = killed.cancelled() => {}
                }
            };
            let _ = axum::serve(listener, app).with_graceful_shutdown(signal).await;
            let _ = exit_tx.send(Some(ProcessExit::Cancelled));
        });

        Ok(RunningProcess::new(
            4_000_000 + u32::from(port),
            request.program,
            exit_rx,
            self.control.clone(),
        ))
    }
}

/// Tree kills stop every fake service started by the runner
#[derive(Default)]
struct KillSwitch {
    token: CancellationToken,
    terminations: AtomicUsize,
}

#[async_trait]
impl ProcessControl for KillSwitch {
    fn platform_name(&self) -> &'static str {
        "test"
    }

    fn prepare(&self, _command: &mut tokio::process::Command) {}

    fn is_alive(&self, _pid: ProcessId) -> bool {
        !self.token.is_cancelled()
    }

    async fn find_child_processes(&self, _pid: ProcessId) -> Vec<ProcessId> {
        Vec::new()
    }

    async fn terminate_tree(&self, _root_pid: ProcessId) -> TerminationResult {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        TerminationResult::Success
    }

    fn emergency_kill(&self, _pid: ProcessId) {
        self.token.cancel();
    }
}

fn http_bridge(runner: &Arc<HttpServiceRunner>) -> PythonBridge {
    PythonBridge::builder()
        .runner(runner.clone())
        .compat_supported(false)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_healthy_service_stops_gracefully() {
    init_tracing();
    let fx = fixture();
    let runner = Arc::new(HttpServiceRunner::new(Behaviour {
        healthy: true,
        honours_shutdown: true,
    }));
    let bridge = http_bridge(&runner);
    let options = quick_options();

    let mut handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(handle.state(), ServiceState::Running);
    assert_eq!(runner.started(), vec![handle.port()]);
    assert!(!handle.has_exited());

    assert!(handle.stop(&options).await);
    assert!(!handle.was_force_killed());
    assert_eq!(runner.control.terminations.load(Ordering::SeqCst), 0);
    assert!(runner.health_hits.load(Ordering::SeqCst) >= 1);
    assert_eq!(runner.shutdown_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_health_check_sends_no_requests() {
    let fx = fixture();
    let runner = Arc::new(HttpServiceRunner::new(Behaviour {
        healthy: true,
        honours_shutdown: true,
    }));
    let bridge = http_bridge(&runner);
    let options = ServiceOptions::builder()
        .health_check_enabled(false)
        .force_kill_timeout_ms(1_000u64)
        .build()
        .unwrap();

    let mut handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(handle.state(), ServiceState::Running);
    assert_eq!(runner.health_hits.load(Ordering::SeqCst), 0);

    assert!(handle.stop(&options).await);
    assert!(!handle.was_force_killed());
    assert_eq!(runner.health_hits.load(Ordering::SeqCst), 0);
    assert_eq!(runner.shutdown_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unhealthy_service_retries_then_fails() {
    let fx = fixture();
    let runner = Arc::new(HttpServiceRunner::new(Behaviour {
        healthy: false,
        honours_shutdown: true,
    }));
    let bridge = http_bridge(&runner);
    let options = ServiceOptions {
        retry_count: 2,
        ..quick_options()
    };

    let error = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Unhealthy);
    assert!(matches!(error, BridgeError::ServiceUnhealthy { attempts: 2 }));
    assert_eq!(runner.started().len(), 2);
}

#[tokio::test]
async fn test_stop_force_kills_service_ignoring_shutdown() {
    let fx = fixture();
    let runner = Arc::new(HttpServiceRunner::new(Behaviour {
        healthy: true,
        honours_shutdown: false,
    }));
    let bridge = http_bridge(&runner);
    let options = ServiceOptions {
        force_kill_timeout_ms: 200,
        ..quick_options()
    };

    let mut handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(handle.stop(&options).await);
    assert!(handle.was_force_killed());
    assert_eq!(runner.control.terminations.load(Ordering::SeqCst), 1);
    assert!(handle.has_exited());
}

#[tokio::test]
async fn test_cancel_during_health_check() {
    let fx = fixture();
    let runner = Arc::new(HttpServiceRunner::new(Behaviour {
        healthy: false,
        honours_shutdown: true,
    }));
    let bridge = http_bridge(&runner);
    let options = ServiceOptions {
        health_check_timeout_ms: 30_000,
        ..quick_options()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let error = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &cancel,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(runner.started().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_process_is_killed_when_it_ignores_shutdown() {
    use std::os::unix::fs::PermissionsExt;

    let fx = fixture();
    let interpreter = native_interpreter_path(&fx.env.install_path);
    std::fs::write(&interpreter, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&interpreter, std::fs::Permissions::from_mode(0o755)).unwrap();

    let runner = Arc::new(MockRunner::answering(0, "", "").spawning());
    let bridge = bridge(&runner, false);
    let options = ServiceOptions {
        health_check_enabled: false,
        force_kill_timeout_ms: 200,
        ..Default::default()
    };

    let mut handle = bridge
        .services()
        .start(
            &fx.script,
            Some(&fx.env),
            &options,
            &ExecutionContext::Native,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert!(handle.pid() > 0);
    assert!(!handle.has_exited());

    assert!(handle.stop(&options).await);
    assert!(handle.was_force_killed());
    assert!(handle.has_exited());
}
