//! Long-running Python services: port reservation, spawn, `/health` polling
//! and a graceful-then-forced stop.

use crate::compat::{ShellMode, shell_request};
use crate::executor::{CommandRunner, OutputSinks, RunningProcess};
use crate::port;
use crate::runner::{ExecutionContext, ScriptRunner};
use pybridge_core::{
    BridgeError, CommandRequest, Environment, ProcessId, Result, ServiceOptions, escape, paths,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a managed service.
///
/// `Starting -> HealthChecking -> Running -> Stopping -> Stopped`, with
/// `Failed` reachable from the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    HealthChecking,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::HealthChecking => "health-checking",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Starts Python services that speak the `/health` + `/shutdown` contract
pub struct ServiceLifecycleManager {
    runner: Arc<dyn CommandRunner>,
    scripts: Arc<ScriptRunner>,
    http: reqwest::Client,
}

impl ServiceLifecycleManager {
    pub fn new(runner: Arc<dyn CommandRunner>, scripts: Arc<ScriptRunner>) -> Result<Self> {
        // Service traffic is always loopback, never through a proxy
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| BridgeError::Other(e.into()))?;
        Ok(Self {
            runner,
            scripts,
            http,
        })
    }

    /// Spawn `script` with `--port N` and wait until it reports healthy.
    ///
    /// Each attempt takes a fresh port unless `options.port` pins one. An
    /// unhealthy attempt is stopped before the next one starts. The process is
    /// killed when `cancel` fires or `timeout` elapses, also after this returns.
    pub async fn start(
        &self,
        script: &Path,
        env: Option<&Environment>,
        options: &ServiceOptions,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ServiceHandle> {
        options.validate()?;
        if !script.is_file() {
            error!(path = %script.display(), "Service script not found");
            return Err(BridgeError::ScriptNotFound(script.to_path_buf()));
        }
        let interpreter = self.scripts.resolve_interpreter(env, context, cancel).await?;
        let script_arg = match &interpreter.distro {
            None => script.to_string_lossy().into_owned(),
            Some(_) => paths::native_to_compat_path(&script.to_string_lossy())?,
        };

        for attempt in 1..=options.retry_count {
            let mut reservation = port::reserve(u32::from(options.port))?;
            let port = reservation.port();

            let request = match &interpreter.distro {
                None => CommandRequest::new(
                    interpreter.path.clone(),
                    [script_arg.clone(), "--port".to_string(), port.to_string()]
                        .into_iter()
                        .chain(options.service_args.iter().cloned()),
                ),
                Some(distro) => shell_request(
                    distro,
                    escape::start_service_command(
                        &interpreter.path,
                        &script_arg,
                        port,
                        &options.service_args,
                    ),
                    ShellMode::Login,
                ),
            }
            .with_timeout(timeout);

            info!(attempt = attempt, port = port, interpreter = %interpreter, script = %script_arg, "Starting Python service");
            // The service binds the port itself moments after spawn
            reservation.release();
            let process = self
                .runner
                .start(request, cancel, OutputSinks::logging(format!("service:{port}")))
                .await?;
            let mut handle = ServiceHandle::new(
                process,
                port,
                interpreter.distro.clone(),
                self.http.clone(),
            );

            if !options.health_check_enabled {
                handle.state = ServiceState::Running;
                info!(pid = handle.pid(), port = port, "Service started without health check");
                return Ok(handle);
            }

            if handle.wait_for_health_check(options, cancel).await {
                info!(pid = handle.pid(), port = port, "Service is healthy");
                return Ok(handle);
            }

            warn!(attempt = attempt, port = port, "Service failed health check, stopping it");
            handle.stop(options).await;
            handle.state = ServiceState::Failed;
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
        }

        error!(attempts = options.retry_count, "Python service never became healthy");
        Err(BridgeError::ServiceUnhealthy {
            attempts: options.retry_count,
        })
    }
}

/// A running service. Stop it with [`ServiceHandle::stop`]. Dropping a handle
/// that was never stopped kills the process tree.
pub struct ServiceHandle {
    process: RunningProcess,
    port: u16,
    distro: Option<String>,
    state: ServiceState,
    force_killed: bool,
    http: reqwest::Client,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("pid", &self.process.pid())
            .field("port", &self.port)
            .field("distro", &self.distro)
            .field("state", &self.state)
            .field("force_killed", &self.force_killed)
            .finish()
    }
}

impl ServiceHandle {
    fn new(
        process: RunningProcess,
        port: u16,
        distro: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            process,
            port,
            distro,
            state: ServiceState::Starting,
            force_killed: false,
            http,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.process.pid()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// WSL distro the service runs in, `None` when native
    pub fn distro(&self) -> Option<&str> {
        self.distro.as_deref()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Whether the last stop had to kill the process tree
    pub fn was_force_killed(&self) -> bool {
        self.force_killed
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    fn url(&self, path: &str) -> String {
        format!("http://localhost:{}/{path}", self.port)
    }

    /// Poll `GET /health` until a 2xx answer or the overall timeout.
    ///
    /// Connection errors and slow requests are retried after
    /// `health_check_retry_delay`. Returns `false` on timeout, cancellation or
    /// when the process exits first.
    pub async fn wait_for_health_check(
        &mut self,
        options: &ServiceOptions,
        cancel: &CancellationToken,
    ) -> bool {
        self.state = ServiceState::HealthChecking;
        let url = self.url("health");
        let deadline = Instant::now() + options.health_check_timeout();

        loop {
            if self.process.has_exited() {
                warn!(pid = self.pid(), exit = ?self.process.exit(), "Service exited during health check");
                return false;
            }

            let request = self
                .http
                .get(&url)
                .timeout(options.health_check_request_timeout())
                .send();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.port, "Health check cancelled");
                    return false;
                }
                response = request => match response {
                    Ok(response) if response.status().is_success() => {
                        self.state = ServiceState::Running;
                        return true;
                    }
                    Ok(response) => debug!(port = self.port, status = %response.status(), "Health check not ready"),
                    Err(e) => debug!(port = self.port, error = %e, "Health check request failed"),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(port = self.port, timeout = ?options.health_check_timeout(), "Health check timed out");
                return false;
            }
            let delay = options.health_check_retry_delay().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.port, "Health check cancelled");
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Ask the service to shut down, then kill its tree if it lingers.
    ///
    /// Returns whether the port is free afterwards, whatever the kill did.
    pub async fn stop(&mut self, options: &ServiceOptions) -> bool {
        self.state = ServiceState::Stopping;
        info!(pid = self.pid(), port = self.port, "Stopping Python service");

        let shutdown = self
            .http
            .get(self.url("shutdown"))
            .timeout(options.health_check_request_timeout())
            .send()
            .await;
        match shutdown {
            Ok(response) => debug!(port = self.port, status = %response.status(), "Shutdown requested"),
            Err(e) => debug!(port = self.port, error = %e, "Shutdown request failed"),
        }

        let deadline = Instant::now() + options.force_kill_timeout();
        loop {
            if self.process.has_exited() && self.port_is_free() {
                debug!(pid = self.pid(), "Service exited gracefully");
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(options.process_stopped_check_delay()).await;
        }

        if !self.process.has_exited() {
            warn!(pid = self.pid(), "Service still running, killing process tree");
            let result = self.process.kill_tree().await;
            if !result.is_gone() {
                warn!(pid = self.pid(), ?result, "Process tree kill incomplete");
            }
            self.force_killed = true;
            if !self.process.wait_for_exit(options.stop_timeout()).await {
                warn!(pid = self.pid(), timeout = ?options.stop_timeout(), "Service did not exit within stop timeout");
            }
        }

        self.state = ServiceState::Stopped;
        let free = self.port_is_free();
        if free {
            info!(port = self.port, "Python service stopped");
        } else {
            warn!(port = self.port, "Port still in use after stopping service");
        }
        free
    }

    fn port_is_free(&self) -> bool {
        port::check_free(u32::from(self.port)).unwrap_or(false)
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.state != ServiceState::Stopped && !self.process.has_exited() {
            warn!(pid = self.pid(), "Service handle dropped while running, killing process tree");
            self.process.emergency_kill();
        }
    }
}
