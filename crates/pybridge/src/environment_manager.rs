//! Package-manager discovery and environment catalogs, native and per WSL distro.
//!
//! All cached state sits in one [`ManagerState`] behind a std mutex. The lock is
//! taken only to read or write fields and is never held across an await, so two
//! slow subprocess calls never serialize on it.

use crate::compat::{CompatLayerRegistry, ShellMode};
use crate::executor::CommandRunner;
use pybridge_core::{
    BASE_ENVIRONMENT, BridgeError, BridgeOptions, CommandRequest, Environment, EnvironmentCatalog,
    ExecutionResult, Result, escape, parse_info_json, paths,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(windows)]
const PACKAGE_MANAGER_NAMES: [&str; 2] = ["conda.exe", "mamba.exe"];
#[cfg(not(windows))]
const PACKAGE_MANAGER_NAMES: [&str; 2] = ["conda", "mamba"];

const COMPAT_PACKAGE_MANAGER_NAMES: [&str; 2] = ["conda", "mamba"];

#[derive(Debug, Default)]
struct ManagerState {
    package_manager: Option<PathBuf>,
    compat_distro: Option<String>,
    /// Resolved conda/mamba per distro name
    compat_package_managers: HashMap<String, String>,
    native_catalog: Option<EnvironmentCatalog>,
    compat_catalogs: HashMap<String, EnvironmentCatalog>,
    initialized: bool,
}

/// Conventional install locations, checked after `PATH`
fn candidate_locations() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let home = dirs::home_dir();

    if cfg!(windows) {
        let local = dirs::data_local_dir();
        for exe in PACKAGE_MANAGER_NAMES {
            for root in [&home, &local].into_iter().flatten() {
                for dist in ["miniconda3", "anaconda3"] {
                    candidates.push(root.join(dist).join("Scripts").join(exe));
                }
            }
        }
    } else {
        for exe in PACKAGE_MANAGER_NAMES {
            if let Some(home) = &home {
                for dist in ["miniconda3", "anaconda3"] {
                    candidates.push(home.join(dist).join("bin").join(exe));
                }
            }
            for dir in ["/opt/miniconda3/bin", "/opt/anaconda3/bin", "/usr/local/bin"] {
                candidates.push(Path::new(dir).join(exe));
            }
        }
    }
    candidates
}

/// Discovers conda/mamba and lists, creates and deletes its environments.
///
/// One instance owns its cache. Build several for independent state.
pub struct EnvironmentManager {
    runner: Arc<dyn CommandRunner>,
    registry: Arc<CompatLayerRegistry>,
    state: Mutex<ManagerState>,
    cancel: CancellationToken,
    /// Replaces `PATH` when looking up conda/mamba
    search_path: Option<OsString>,
}

impl EnvironmentManager {
    pub fn new(runner: Arc<dyn CommandRunner>, registry: Arc<CompatLayerRegistry>) -> Self {
        Self {
            runner,
            registry,
            state: Mutex::new(ManagerState::default()),
            cancel: CancellationToken::new(),
            search_path: None,
        }
    }

    /// Search these directories instead of `PATH` during auto-detection
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        let found = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_default();
                which::which_in(name, Some(paths), cwd)
            }
            None => which::which(name),
        };
        found.ok()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Arc<CompatLayerRegistry> {
        &self.registry
    }

    /// Cancelling this token aborts every in-flight subprocess started by the manager
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn package_manager_path(&self) -> Option<PathBuf> {
        self.lock().package_manager.clone()
    }

    pub fn compat_distro(&self) -> Option<String> {
        self.lock().compat_distro.clone()
    }

    /// Resolved conda/mamba inside `distro`, or inside the selected distro
    pub fn compat_package_manager_path(&self, distro: Option<&str>) -> Option<String> {
        let state = self.lock();
        let distro = distro.map(str::to_string).or_else(|| state.compat_distro.clone())?;
        state.compat_package_managers.get(&distro).cloned()
    }

    /// Clear every cached path and catalog
    pub fn reset(&self) {
        info!("Resetting environment manager");
        *self.lock() = ManagerState::default();
    }

    /// Discover package managers and load catalogs.
    ///
    /// A no-op once initialized unless `reinitialize` is set, which clears all
    /// cached state first. Explicit paths in `options` are validated before
    /// they are accepted, and an explicit distro must be installed. Failure to set up WSL during auto-detection is logged
    /// and leaves WSL support unavailable.
    pub async fn initialize(
        &self,
        options: Option<&BridgeOptions>,
        reinitialize: bool,
    ) -> Result<()> {
        if self.is_initialized() && !reinitialize {
            return Ok(());
        }
        if reinitialize {
            info!("Reinitializing environment manager, clearing cached state");
            self.reset();
            self.registry.invalidate();
        }

        match options {
            Some(options) => {
                options.validate()?;
                info!(
                    package_manager = ?options.package_manager_path,
                    distro = ?options.compat_distro,
                    compat_package_manager = ?options.compat_package_manager_path,
                    "Initializing environment manager with options"
                );
                self.initialize_native(options.package_manager_path.as_deref())
                    .await?;
                if let Some(distro) = &options.compat_distro {
                    if let Err(e) = self.registry.find_distro(distro, &self.cancel).await {
                        warn!(distro = %distro, error = %e, "Configured WSL distro is unavailable");
                        return Err(e);
                    }
                }
                match (&options.compat_distro, &options.compat_package_manager_path) {
                    (Some(distro), Some(manager)) => {
                        self.accept_compat_package_manager(distro, manager).await?;
                        self.list_environments_compat(Some(distro.as_str()), true).await?;
                    }
                    (Some(distro), None) => {
                        self.lock().compat_distro = Some(distro.clone());
                        self.try_initialize_compat(distro).await;
                    }
                    _ => {}
                }
            }
            None => {
                info!("Initializing environment manager with auto-detection");
                self.initialize_native(None).await?;
                self.auto_detect_compat().await;
            }
        }

        self.lock().initialized = true;
        Ok(())
    }

    async fn initialize_native(&self, explicit: Option<&Path>) -> Result<()> {
        match explicit {
            Some(path) => {
                if !path.is_file() {
                    warn!(path = %path.display(), "Package manager not found");
                    return Err(BridgeError::FileNotFound(path.to_path_buf()));
                }
                self.lock().package_manager = Some(path.to_path_buf());
            }
            None => {
                self.native_package_manager()?;
            }
        }
        self.list_environments(true).await?;
        Ok(())
    }

    async fn auto_detect_compat(&self) {
        if !self.registry.is_supported() {
            debug!("WSL not available on this host, skipping WSL detection");
            return;
        }
        match self.registry.default_distro(&self.cancel).await {
            Ok(Some(distro)) => {
                self.lock().compat_distro = Some(distro.name.clone());
                self.try_initialize_compat(&distro.name).await;
            }
            Ok(None) => info!("No default WSL distro found, skipping WSL detection"),
            Err(e) => warn!(error = %e, "Failed to list WSL distros"),
        }
    }

    async fn try_initialize_compat(&self, distro: &str) {
        let result = async {
            self.compat_package_manager(distro).await?;
            self.list_environments_compat(Some(distro), true).await
        }
        .await;
        if let Err(e) = result {
            warn!(distro = %distro, error = %e, "Failed to auto-detect conda or mamba in WSL");
            self.lock().compat_package_managers.remove(distro);
        }
    }

    async fn accept_compat_package_manager(&self, distro: &str, manager: &str) -> Result<()> {
        self.registry.ensure_warm(distro, &self.cancel).await?;
        let manager = paths::native_to_compat_path(manager)?;
        if self.registry.which(distro, &manager, &self.cancel).await?.is_none() {
            warn!(distro = %distro, path = %manager, "Package manager not found in WSL");
            return Err(BridgeError::FileNotFound(PathBuf::from(manager)));
        }
        let mut state = self.lock();
        state.compat_distro = Some(distro.to_string());
        state
            .compat_package_managers
            .insert(distro.to_string(), manager);
        Ok(())
    }

    /// Native conda/mamba: the cached path, else `PATH`, else well-known install dirs
    pub fn native_package_manager(&self) -> Result<PathBuf> {
        if let Some(path) = self.package_manager_path() {
            return Ok(path);
        }

        let found = PACKAGE_MANAGER_NAMES
            .iter()
            .filter_map(|name| self.which(name))
            .find(|path| path.is_file())
            .or_else(|| candidate_locations().into_iter().find(|path| path.is_file()));

        match found {
            Some(path) => {
                info!(path = %path.display(), "Found package manager");
                self.lock().package_manager = Some(path.clone());
                Ok(path)
            }
            None => {
                warn!("Unable to locate conda or mamba");
                Err(BridgeError::PackageManagerNotFound { distro: None })
            }
        }
    }

    /// conda/mamba inside `distro`, resolved with `which` after a warm-up and cached per distro
    pub async fn compat_package_manager(&self, distro: &str) -> Result<String> {
        if let Some(path) = self.lock().compat_package_managers.get(distro).cloned() {
            return Ok(path);
        }

        self.registry.ensure_warm(distro, &self.cancel).await?;
        for exe in COMPAT_PACKAGE_MANAGER_NAMES {
            if let Some(path) = self.registry.which(distro, exe, &self.cancel).await? {
                self.lock()
                    .compat_package_managers
                    .insert(distro.to_string(), path.clone());
                return Ok(path);
            }
        }
        Err(BridgeError::PackageManagerNotFound {
            distro: Some(distro.to_string()),
        })
    }

    /// The selected distro, else the WSL default
    pub async fn default_distro(&self) -> Result<String> {
        if let Some(distro) = self.compat_distro() {
            return Ok(distro);
        }
        match self.registry.default_distro(&self.cancel).await? {
            Some(distro) => Ok(distro.name),
            None => Err(BridgeError::NoDefaultDistro),
        }
    }

    async fn resolve_distro(&self, distro: Option<&str>) -> Result<String> {
        match distro {
            Some(d) if d.trim().is_empty() => {
                Err(BridgeError::invalid_argument("distro name cannot be empty"))
            }
            Some(d) => Ok(d.to_string()),
            None => self.default_distro().await,
        }
    }

    fn tool_failed(request: &CommandRequest, result: ExecutionResult) -> BridgeError {
        BridgeError::ToolFailed {
            command: request.to_string(),
            exit_code: result.exit_code,
            stderr: result.stderr,
        }
    }

    async fn run_native(&self, args: Vec<String>) -> Result<ExecutionResult> {
        let manager = self.native_package_manager()?;
        let request = CommandRequest::new(manager.to_string_lossy(), args);
        debug!(command = %request, "Running package manager");
        let result = self.runner.run(request.clone(), &self.cancel).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(Self::tool_failed(&request, result))
        }
    }

    /// Native environments from `info --json`, cached unless `refresh`
    pub async fn list_environments(&self, refresh: bool) -> Result<Vec<Environment>> {
        Ok(self.native_catalog(refresh).await?.to_vec())
    }

    async fn native_catalog(&self, refresh: bool) -> Result<EnvironmentCatalog> {
        if !refresh {
            if let Some(catalog) = self.lock().native_catalog.clone() {
                return Ok(catalog);
            }
        }
        info!("Listing native environments");
        let result = self.run_native(vec!["info".into(), "--json".into()]).await?;
        let catalog = parse_info_json(&result.stdout, None)?;
        self.lock().native_catalog = Some(catalog.clone());
        Ok(catalog)
    }

    /// Environments inside `distro` (default: the selected or default distro)
    pub async fn list_environments_compat(
        &self,
        distro: Option<&str>,
        refresh: bool,
    ) -> Result<Vec<Environment>> {
        Ok(self.compat_catalog(distro, refresh).await?.to_vec())
    }

    async fn compat_catalog(&self, distro: Option<&str>, refresh: bool) -> Result<EnvironmentCatalog> {
        let distro = self.resolve_distro(distro).await?;
        if !refresh {
            if let Some(catalog) = self.lock().compat_catalogs.get(&distro).cloned() {
                return Ok(catalog);
            }
        }

        info!(distro = %distro, "Listing WSL environments");
        let manager = self.compat_package_manager(&distro).await?;
        let command = escape::package_manager_command(&manager, &["info", "--json"]);
        let result = self
            .registry
            .run_shell_checked(&distro, command, ShellMode::Login, None, &self.cancel)
            .await?;
        let catalog = parse_info_json(&result.stdout, Some(&distro))?;
        self.lock()
            .compat_catalogs
            .insert(distro.clone(), catalog.clone());
        Ok(catalog)
    }

    /// Look up a native environment by name, case-insensitively. Defaults to `base`.
    pub async fn get_environment(&self, name: Option<&str>) -> Result<Environment> {
        let name = name.unwrap_or(BASE_ENVIRONMENT);
        self.native_catalog(false)
            .await?
            .find(name)
            .cloned()
            .ok_or_else(|| BridgeError::EnvironmentNotFound(name.to_string()))
    }

    /// Look up an environment inside a distro. Defaults to `base`.
    pub async fn get_environment_compat(
        &self,
        name: Option<&str>,
        distro: Option<&str>,
    ) -> Result<Environment> {
        let name = name.unwrap_or(BASE_ENVIRONMENT);
        self.compat_catalog(distro, false)
            .await?
            .find(name)
            .cloned()
            .ok_or_else(|| BridgeError::EnvironmentNotFound(name.to_string()))
    }

    /// Base native environment, initializing on first use
    pub async fn base_environment(&self) -> Result<Environment> {
        let cached = self.lock().native_catalog.as_ref().is_some_and(|c| !c.is_empty());
        if !cached && !self.is_initialized() {
            self.initialize(None, false).await?;
        }
        self.native_catalog(false)
            .await?
            .base()
            .cloned()
            .ok_or_else(|| BridgeError::EnvironmentNotFound(BASE_ENVIRONMENT.to_string()))
    }

    /// Base environment of a distro, initializing on first use
    pub async fn base_environment_compat(&self, distro: Option<&str>) -> Result<Environment> {
        if distro.is_none() && self.compat_distro().is_none() && !self.is_initialized() {
            self.initialize(None, false).await?;
        }
        self.compat_catalog(distro, false)
            .await?
            .base()
            .cloned()
            .ok_or_else(|| BridgeError::EnvironmentNotFound(BASE_ENVIRONMENT.to_string()))
    }

    /// `env create -f <yaml> [-n <name>]`
    pub async fn create_environment(&self, yaml_file: &Path, name: Option<&str>) -> Result<()> {
        if !yaml_file.is_file() {
            return Err(BridgeError::FileNotFound(yaml_file.to_path_buf()));
        }
        let mut args = vec![
            "env".to_string(),
            "create".to_string(),
            "-f".to_string(),
            yaml_file.to_string_lossy().into_owned(),
        ];
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            args.extend(["-n".to_string(), name.to_string()]);
        }

        info!(file = %yaml_file.display(), name = ?name, "Creating environment");
        self.run_native(args).await?;
        self.lock().native_catalog = None;
        Ok(())
    }

    /// `env remove -n <name> --yes`
    pub async fn delete_environment(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BridgeError::invalid_argument("environment name cannot be empty"));
        }
        info!(name = %name, "Deleting environment");
        self.run_native(vec![
            "env".into(),
            "remove".into(),
            "-n".into(),
            name.to_string(),
            "--yes".into(),
        ])
        .await?;
        self.lock().native_catalog = None;
        Ok(())
    }

    /// Create an environment inside a distro from a YAML file on the Windows side
    pub async fn create_environment_compat(
        &self,
        yaml_file: &Path,
        name: Option<&str>,
        distro: Option<&str>,
    ) -> Result<()> {
        if !yaml_file.is_file() {
            return Err(BridgeError::FileNotFound(yaml_file.to_path_buf()));
        }
        let compat_yaml = paths::native_to_compat_path(&yaml_file.to_string_lossy())?;
        let distro = self.resolve_distro(distro).await?;
        let manager = self.compat_package_manager(&distro).await?;

        info!(distro = %distro, file = %compat_yaml, name = ?name, "Creating WSL environment");
        let command = escape::create_env_command(&manager, &compat_yaml, name);
        self.registry
            .run_shell_checked(&distro, command, ShellMode::Login, None, &self.cancel)
            .await?;
        self.lock().compat_catalogs.remove(&distro);
        Ok(())
    }

    pub async fn delete_environment_compat(&self, name: &str, distro: Option<&str>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BridgeError::invalid_argument("environment name cannot be empty"));
        }
        let distro = self.resolve_distro(distro).await?;
        let manager = self.compat_package_manager(&distro).await?;

        info!(distro = %distro, name = %name, "Deleting WSL environment");
        let command = escape::remove_env_command(&manager, name);
        self.registry
            .run_shell_checked(&distro, command, ShellMode::Login, None, &self.cancel)
            .await?;
        self.lock().compat_catalogs.remove(&distro);
        Ok(())
    }
}
