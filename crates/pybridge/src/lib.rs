//! PyBridge - run Python from Rust through conda/mamba environments.
//!
//! Discovers conda or mamba natively and inside WSL distros, lists, creates
//! and deletes environments, runs scripts and inline code, and manages
//! long-running Python services on a reserved port with health checks and a
//! graceful-then-forced stop.
//!
//! ```no_run
//! # async fn demo() -> pybridge::Result<()> {
//! use pybridge::{ExecutionContext, PythonBridge};
//! use tokio_util::sync::CancellationToken;
//!
//! let bridge = PythonBridge::builder().build()?;
//! bridge.environments().initialize(None, false).await?;
//! let result = bridge
//!     .scripts()
//!     .run_code("print('hi')", None, &ExecutionContext::Native, &CancellationToken::new(), None)
//!     .await?;
//! assert_eq!(result.stdout.trim(), "hi");
//! # Ok(())
//! # }
//! ```

pub mod compat;
pub mod environment_manager;
pub mod executor;
pub mod logging;
pub mod platform;
pub mod port;
pub mod runner;
pub mod service;

pub use compat::{CompatLayerRegistry, ShellMode};
pub use environment_manager::EnvironmentManager;
pub use executor::{CommandRunner, OutputSinks, ProcessExecutor, ProcessExit, RunningProcess};
pub use port::ReservedPort;
pub use pybridge_core::*;
pub use runner::{ExecutionContext, Interpreter, ScriptRunner};
pub use service::{ServiceHandle, ServiceLifecycleManager, ServiceState};

use std::ffi::OsString;
use std::sync::Arc;
use tracing::info;

/// Owns one set of collaborators and their caches.
///
/// Every subsystem shells out through the same [`CommandRunner`], so a test can
/// swap the whole process layer by handing the builder a mock.
pub struct PythonBridge {
    runner: Arc<dyn CommandRunner>,
    registry: Arc<CompatLayerRegistry>,
    environments: Arc<EnvironmentManager>,
    scripts: Arc<ScriptRunner>,
    services: ServiceLifecycleManager,
}

impl PythonBridge {
    pub fn builder() -> PythonBridgeBuilder {
        PythonBridgeBuilder::default()
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn compat(&self) -> &Arc<CompatLayerRegistry> {
        &self.registry
    }

    pub fn environments(&self) -> &Arc<EnvironmentManager> {
        &self.environments
    }

    pub fn scripts(&self) -> &Arc<ScriptRunner> {
        &self.scripts
    }

    pub fn services(&self) -> &ServiceLifecycleManager {
        &self.services
    }

    /// Abort every in-flight package-manager and WSL call
    pub fn shutdown(&self) {
        info!("Shutting down Python bridge");
        self.environments.cancel_token().cancel();
    }
}

/// Builder for [`PythonBridge`]
#[derive(Default)]
pub struct PythonBridgeBuilder {
    options: Option<BridgeOptions>,
    runner: Option<Arc<dyn CommandRunner>>,
    compat_supported: Option<bool>,
    search_path: Option<OsString>,
}

impl PythonBridgeBuilder {
    /// Timing knobs for WSL calls. Explicit paths are applied by
    /// [`EnvironmentManager::initialize`].
    pub fn options(mut self, options: BridgeOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Force WSL support on or off instead of detecting the host
    pub fn compat_supported(mut self, supported: bool) -> Self {
        self.compat_supported = Some(supported);
        self
    }

    /// Directories searched for conda/mamba instead of `PATH`
    pub fn search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn build(self) -> Result<PythonBridge> {
        let options = self.options.unwrap_or_default();
        options.validate()?;
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessExecutor::new()));

        let mut registry = CompatLayerRegistry::new(runner.clone(), options);
        if let Some(supported) = self.compat_supported {
            registry = registry.with_support(supported);
        }
        let registry = Arc::new(registry);
        let mut environments = EnvironmentManager::new(runner.clone(), registry.clone());
        if let Some(search_path) = self.search_path {
            environments = environments.with_search_path(search_path);
        }
        let environments = Arc::new(environments);
        let scripts = Arc::new(ScriptRunner::new(runner.clone(), environments.clone()));
        let services = ServiceLifecycleManager::new(runner.clone(), scripts.clone())?;

        Ok(PythonBridge {
            runner,
            registry,
            environments,
            scripts,
            services,
        })
    }
}
