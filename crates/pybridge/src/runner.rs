//! Interpreter resolution and one-shot script / inline-code execution.

use crate::compat::{ShellMode, shell_request};
use crate::environment_manager::EnvironmentManager;
use crate::executor::CommandRunner;
use crate::platform::native_interpreter_path;
use pybridge_core::{
    BridgeError, CommandRequest, Environment, ExecutionResult, Result, escape, paths,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where an interpreter lives and runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionContext {
    #[default]
    Native,
    /// Inside a WSL distro. `None` picks the environment's distro, then the default one.
    Compat(Option<String>),
}

impl ExecutionContext {
    pub fn compat(distro: impl Into<String>) -> Self {
        ExecutionContext::Compat(Some(distro.into()))
    }

    pub fn is_compat(&self) -> bool {
        matches!(self, ExecutionContext::Compat(_))
    }
}

/// A verified interpreter path, plus the distro it lives in for WSL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub path: String,
    pub distro: Option<String>,
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.distro {
            Some(distro) => write!(f, "{} [WSL: {distro}]", self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Resolves interpreters and runs scripts or inline code through them
pub struct ScriptRunner {
    runner: Arc<dyn CommandRunner>,
    environments: Arc<EnvironmentManager>,
}

impl ScriptRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, environments: Arc<EnvironmentManager>) -> Self {
        Self {
            runner,
            environments,
        }
    }

    /// Map an environment (default: base) to a verified interpreter.
    ///
    /// Native paths are checked on the local filesystem. WSL paths are probed
    /// with `test -f` inside the distro after a warm-up.
    pub async fn resolve_interpreter(
        &self,
        env: Option<&Environment>,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Interpreter> {
        match context {
            ExecutionContext::Native => {
                let env = match env {
                    Some(env) => env.clone(),
                    None => self.environments.base_environment().await?,
                };
                let exe = native_interpreter_path(&env.install_path);
                if !exe.is_file() {
                    error!(env = %env.name, path = %exe.display(), "Python executable not found");
                    return Err(BridgeError::InterpreterNotFound {
                        env: env.name,
                        path: exe.display().to_string(),
                    });
                }
                Ok(Interpreter {
                    path: exe.to_string_lossy().into_owned(),
                    distro: None,
                })
            }
            ExecutionContext::Compat(distro) => {
                let distro = match distro
                    .clone()
                    .or_else(|| env.and_then(|e| e.compat_distro.clone()))
                {
                    Some(distro) => distro,
                    None => self.environments.default_distro().await?,
                };
                let env = match env {
                    Some(env) => env.clone(),
                    None => {
                        self.environments
                            .base_environment_compat(Some(&distro))
                            .await?
                    }
                };
                let exe = format!("{}/bin/python", env.install_path.trim_end_matches('/'));

                let registry = self.environments.registry();
                registry.ensure_warm(&distro, cancel).await?;
                let probe = registry
                    .run_shell(
                        &distro,
                        escape::file_exists_probe(&exe),
                        ShellMode::Plain,
                        Some(registry.options().file_probe_timeout()),
                        cancel,
                    )
                    .await?;
                let answer = probe.stdout.lines().map(str::trim).rfind(|l| !l.is_empty());
                if answer != Some("exists") {
                    error!(
                        env = %env.name,
                        path = %exe,
                        distro = %distro,
                        stdout = %probe.stdout.trim(),
                        stderr = %probe.stderr.trim(),
                        "Python executable not found inside WSL"
                    );
                    return Err(BridgeError::InterpreterNotFound {
                        env: env.name,
                        path: format!("{exe} (WSL: {distro})"),
                    });
                }
                Ok(Interpreter {
                    path: exe,
                    distro: Some(distro),
                })
            }
        }
    }

    /// Run a script file. It must exist on the local filesystem, also for WSL,
    /// where its path is translated to `/mnt/<drive>/...`.
    pub async fn run_script(
        &self,
        script: &Path,
        env: Option<&Environment>,
        args: &[String],
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        if !script.is_file() {
            error!(path = %script.display(), "Python script not found");
            return Err(BridgeError::ScriptNotFound(script.to_path_buf()));
        }
        let interpreter = self.resolve_interpreter(env, context, cancel).await?;
        let script = script.to_string_lossy();

        let request = match &interpreter.distro {
            None => CommandRequest::new(
                interpreter.path.clone(),
                std::iter::once(script.to_string()).chain(args.iter().cloned()),
            ),
            Some(distro) => {
                let script = paths::native_to_compat_path(&script)?;
                let command = escape::run_script_command(&interpreter.path, &script, args);
                shell_request(distro, command, ShellMode::Interactive)
            }
        };

        info!(interpreter = %interpreter, script = %script, "Running script");
        self.execute(request.with_timeout(timeout), cancel).await
    }

    /// Run inline code with `python -c`
    pub async fn run_code(
        &self,
        code: &str,
        env: Option<&Environment>,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let interpreter = self.resolve_interpreter(env, context, cancel).await?;
        let request = match &interpreter.distro {
            None => CommandRequest::new(interpreter.path.clone(), ["-c", code]),
            Some(distro) => shell_request(
                distro,
                escape::run_code_command(&interpreter.path, code),
                ShellMode::Interactive,
            ),
        };

        info!(interpreter = %interpreter, "Running inline code");
        self.execute(request.with_timeout(timeout), cancel).await
    }

    async fn execute(
        &self,
        request: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        debug!(command = %request, "Executing");
        let result = self.runner.run(request, cancel).await?;
        if !result.success() {
            error!(exit_code = result.exit_code, stderr = %result.stderr.trim(), "Python execution failed");
            return Err(BridgeError::ScriptFailed {
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}
