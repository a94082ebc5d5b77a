//! WSL distro discovery, warm-up and the `wsl -d <distro> bash -lc` wrapper.

use crate::executor::CommandRunner;
use backon::{ConstantBuilder, Retryable};
use pybridge_core::{
    BridgeError, BridgeOptions, CommandRequest, CompatDistro, DistroList, ExecutionResult,
    OutputEncoding, Result, escape, parse_distro_list,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Host-side launcher for the compatibility layer
pub const COMPAT_LAUNCHER: &str = "wsl";

const WARMUP_MESSAGE: &str = "WSL Distro Warmed Up";
const BANNER_MARKERS: [&str; 3] = ["welcome to", "microsoft", "wsl"];

/// How bash is started inside the distro. `Interactive` (`-lic`) also sources
/// `.bashrc`, where conda's shell hook usually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMode {
    Plain,
    Login,
    Interactive,
}

impl ShellMode {
    fn flag(self) -> &'static str {
        match self {
            ShellMode::Plain => "-c",
            ShellMode::Login => "-lc",
            ShellMode::Interactive => "-lic",
        }
    }
}

/// `wsl -d <distro> bash -c|-lc|-lic <command>`
pub fn shell_request(distro: &str, command: impl Into<String>, mode: ShellMode) -> CommandRequest {
    CommandRequest::new(
        COMPAT_LAUNCHER,
        [
            "-d".to_string(),
            distro.to_string(),
            "bash".to_string(),
            mode.flag().to_string(),
            command.into(),
        ],
    )
}

/// Whether a line is a WSL login banner rather than command output
pub fn looks_like_banner(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with('/') {
        return false;
    }
    let lower = line.to_lowercase();
    BANNER_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Default)]
struct RegistryState {
    distros: Option<DistroList>,
    warmed: HashSet<String>,
}

/// Enumerates WSL distros and keeps them warm. Holds the only cached distro list.
pub struct CompatLayerRegistry {
    runner: Arc<dyn CommandRunner>,
    options: BridgeOptions,
    supported: bool,
    state: Mutex<RegistryState>,
}

impl CompatLayerRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>, options: BridgeOptions) -> Self {
        Self {
            runner,
            options,
            supported: cfg!(windows),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Override host detection, e.g. to drive the registry through a mock runner
    pub fn with_support(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    fn ensure_supported(&self) -> Result<()> {
        if self.supported {
            Ok(())
        } else {
            Err(BridgeError::UnsupportedPlatform(
                "WSL is only available on Windows 10/11".to_string(),
            ))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the cached distro list and warm-up marks
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.distros = None;
        state.warmed.clear();
    }

    /// List installed distros, warming each one. Cached until `refresh`.
    ///
    /// No installed distro is not an error: the list comes back empty and a
    /// warning is logged. A distro that fails to warm up is logged and stays
    /// in the list. Only cancellation and other permanent errors propagate.
    pub async fn list_distros(&self, refresh: bool, cancel: &CancellationToken) -> Result<DistroList> {
        self.ensure_supported()?;
        if !refresh {
            if let Some(distros) = self.lock().distros.clone() {
                return Ok(distros);
            }
        }

        let request = CommandRequest::new(COMPAT_LAUNCHER, ["-l", "-v"])
            .with_timeout(Some(self.options.list_distros_timeout()))
            .with_encoding(OutputEncoding::Utf16Le);
        let result = self.runner.run(request.clone(), cancel).await?;
        if !result.success() {
            return Err(BridgeError::ToolFailed {
                command: request.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let distros = parse_distro_list(&result.stdout);
        if distros.is_empty() {
            warn!("No WSL distributions found");
        }
        for distro in &distros.distros {
            debug!(distro = %distro.name, default = distro.is_default, "Found WSL distro");
            if let Err(e) = self.ensure_warm(&distro.name, cancel).await {
                if e.is_permanent() {
                    return Err(e);
                }
                warn!(distro = %distro.name, error = %e, "Distro did not warm up");
            }
        }

        self.lock().distros = Some(distros.clone());
        Ok(distros)
    }

    pub async fn default_distro(&self, cancel: &CancellationToken) -> Result<Option<CompatDistro>> {
        Ok(self.list_distros(false, cancel).await?.default_distro().cloned())
    }

    /// Look up an installed distro by name, case-insensitively
    pub async fn find_distro(&self, name: &str, cancel: &CancellationToken) -> Result<CompatDistro> {
        self.list_distros(false, cancel)
            .await?
            .find(name)
            .cloned()
            .ok_or_else(|| BridgeError::DistroNotFound(name.to_string()))
    }

    /// Warm up `distro` unless it already answered since the last invalidation
    pub async fn ensure_warm(&self, distro: &str, cancel: &CancellationToken) -> Result<()> {
        if self.lock().warmed.contains(distro) {
            return Ok(());
        }
        self.warm_up(distro, cancel).await.map(|_| ())
    }

    /// Run a throwaway `echo` in the distro until it answers, with bounded retries
    pub async fn warm_up(&self, distro: &str, cancel: &CancellationToken) -> Result<ExecutionResult> {
        self.ensure_supported()?;
        if distro.trim().is_empty() {
            return Err(BridgeError::invalid_argument("distro name cannot be empty"));
        }

        let attempts = self.options.warmup_retries.max(1);
        let request = CommandRequest::new(
            COMPAT_LAUNCHER,
            ["-d", distro, "echo", WARMUP_MESSAGE],
        )
        .with_timeout(Some(self.options.warmup_timeout()));

        let backoff = ConstantBuilder::default()
            .with_delay(self.options.warmup_retry_delay())
            .with_max_times(attempts as usize - 1);

        let result = (|| self.run_checked(request.clone(), cancel))
            .retry(backoff)
            .when(|e: &BridgeError| e.is_retryable())
            .notify(|e: &BridgeError, delay: Duration| {
                warn!(distro = %distro, error = %e, ?delay, "Warm-up attempt failed, retrying");
            })
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    BridgeError::WarmUpFailed {
                        distro: distro.to_string(),
                        attempts,
                    }
                } else {
                    e
                }
            })?;

        debug!(distro = %distro, "WSL distro is warmed up");
        self.lock().warmed.insert(distro.to_string());
        Ok(result)
    }

    /// Run `command` through bash inside `distro`. The exit code is left to the caller.
    pub async fn run_shell(
        &self,
        distro: &str,
        command: impl Into<String>,
        mode: ShellMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.ensure_supported()?;
        let request = shell_request(distro, command, mode).with_timeout(timeout);
        self.runner.run(request, cancel).await
    }

    /// Like [`run_shell`](Self::run_shell) but a non-zero exit becomes `ToolFailed`
    pub async fn run_shell_checked(
        &self,
        distro: &str,
        command: impl Into<String>,
        mode: ShellMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.ensure_supported()?;
        let request = shell_request(distro, command, mode).with_timeout(timeout);
        self.run_checked(request, cancel).await
    }

    /// Resolve `executable` with `which` in an interactive login shell.
    ///
    /// A freshly started distro can print its login banner in place of the
    /// command output, so banner-looking output is retried a bounded number of
    /// times. Returns `None` when the executable is not on the distro's PATH.
    pub async fn which(
        &self,
        distro: &str,
        executable: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let command = escape::which_command(executable);
        let backoff = ConstantBuilder::default()
            .with_delay(self.options.banner_retry_delay())
            .with_max_times(self.options.banner_retries as usize);

        let found = (|| self.which_once(distro, &command, cancel))
            .retry(backoff)
            .when(|e: &BridgeError| matches!(e, BridgeError::UnexpectedOutput { .. }))
            .notify(|_: &BridgeError, _: Duration| {
                warn!(distro = %distro, "Received WSL welcome banner instead of a path, retrying");
            })
            .await?;

        if let Some(path) = &found {
            info!(distro = %distro, executable = %executable, path = %path, "Resolved executable in WSL");
        }
        Ok(found)
    }

    async fn which_once(
        &self,
        distro: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let result = self
            .run_shell(distro, command, ShellMode::Interactive, None, cancel)
            .await?;
        if !result.success() {
            return Ok(None);
        }
        match result.first_line() {
            Some(line) if looks_like_banner(line) => Err(BridgeError::UnexpectedOutput {
                command: command.to_string(),
                detail: format!("login banner instead of a path: {line}"),
            }),
            Some(line) => Ok(Some(line.to_string())),
            None => Ok(None),
        }
    }

    async fn run_checked(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let result = self.runner.run(request.clone(), cancel).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(BridgeError::ToolFailed {
                command: request.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}
