use crate::error::{BridgeError, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Explicit package-manager / WSL selections plus the timing knobs used while
/// talking to WSL.
///
/// With no paths set, `EnvironmentManager::initialize` auto-detects everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(default, setter(into, strip_option))]
pub struct BridgeOptions {
    /// Native path to the conda or mamba executable
    #[serde(default)]
    pub package_manager_path: Option<PathBuf>,

    /// Name of the WSL distro to use, e.g. `Ubuntu-22.04`
    #[serde(default)]
    pub compat_distro: Option<String>,

    /// Linux path to conda or mamba inside the WSL distro
    #[serde(default)]
    pub compat_package_manager_path: Option<String>,

    #[serde(default = "default_list_distros_timeout_ms")]
    pub list_distros_timeout_ms: u64,

    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,

    /// Total warm-up attempts before giving up
    #[serde(default = "default_warmup_retries")]
    pub warmup_retries: u32,

    #[serde(default = "default_warmup_retry_delay_ms")]
    pub warmup_retry_delay_ms: u64,

    /// Timeout for `test -f` probes inside a distro
    #[serde(default = "default_file_probe_timeout_ms")]
    pub file_probe_timeout_ms: u64,

    /// Extra attempts when a WSL login banner shows up instead of command output
    #[serde(default = "default_banner_retries")]
    pub banner_retries: u32,

    #[serde(default = "default_banner_retry_delay_ms")]
    pub banner_retry_delay_ms: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            package_manager_path: None,
            compat_distro: None,
            compat_package_manager_path: None,
            list_distros_timeout_ms: default_list_distros_timeout_ms(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
            warmup_retries: default_warmup_retries(),
            warmup_retry_delay_ms: default_warmup_retry_delay_ms(),
            file_probe_timeout_ms: default_file_probe_timeout_ms(),
            banner_retries: default_banner_retries(),
            banner_retry_delay_ms: default_banner_retry_delay_ms(),
        }
    }
}

impl BridgeOptions {
    pub fn builder() -> BridgeOptionsBuilder {
        BridgeOptionsBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::invalid_argument(format!("invalid bridge options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.warmup_retries == 0 {
            return Err(BridgeError::invalid_argument(
                "warmup_retries must be at least 1",
            ));
        }
        if matches!(&self.compat_distro, Some(d) if d.trim().is_empty()) {
            return Err(BridgeError::invalid_argument(
                "compat_distro cannot be empty",
            ));
        }
        if self.compat_package_manager_path.is_some() && self.compat_distro.is_none() {
            return Err(BridgeError::invalid_argument(
                "compat_package_manager_path requires compat_distro",
            ));
        }
        Ok(())
    }

    pub fn list_distros_timeout(&self) -> Duration {
        Duration::from_millis(self.list_distros_timeout_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    pub fn warmup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_retry_delay_ms)
    }

    pub fn file_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.file_probe_timeout_ms)
    }

    pub fn banner_retry_delay(&self) -> Duration {
        Duration::from_millis(self.banner_retry_delay_ms)
    }
}

/// Settings for a long-running Python service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(default, setter(into))]
pub struct ServiceOptions {
    /// 0 lets the OS pick a free port
    #[serde(default)]
    pub port: u16,

    /// Extra arguments appended after `--port N`
    #[serde(default = "default_service_args")]
    #[builder(setter(custom))]
    pub service_args: Vec<String>,

    #[serde(default = "default_true")]
    pub health_check_enabled: bool,

    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    #[serde(default = "default_health_check_retry_delay_ms")]
    pub health_check_retry_delay_ms: u64,

    #[serde(default = "default_force_kill_timeout_ms")]
    pub force_kill_timeout_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_process_stopped_check_delay_ms")]
    pub process_stopped_check_delay_ms: u64,

    /// Total start attempts, each with a fresh port
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            port: 0,
            service_args: default_service_args(),
            health_check_enabled: true,
            health_check_timeout_ms: default_health_check_timeout_ms(),
            health_check_retry_delay_ms: default_health_check_retry_delay_ms(),
            force_kill_timeout_ms: default_force_kill_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            process_stopped_check_delay_ms: default_process_stopped_check_delay_ms(),
            retry_count: default_retry_count(),
        }
    }
}

impl ServiceOptions {
    pub fn builder() -> ServiceOptionsBuilder {
        ServiceOptionsBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::invalid_argument(format!("invalid service options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_count == 0 {
            return Err(BridgeError::invalid_argument(
                "retry_count must be at least 1",
            ));
        }
        if self.health_check_enabled && self.health_check_timeout_ms == 0 {
            return Err(BridgeError::invalid_argument(
                "health_check_timeout_ms must be positive when health checks are enabled",
            ));
        }
        Ok(())
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Per-request bound: the shorter of 2s and the overall health-check timeout
    pub fn health_check_request_timeout(&self) -> Duration {
        self.health_check_timeout().min(Duration::from_secs(2))
    }

    pub fn health_check_retry_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_retry_delay_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn process_stopped_check_delay(&self) -> Duration {
        Duration::from_millis(self.process_stopped_check_delay_ms)
    }
}

impl ServiceOptionsBuilder {
    pub fn service_args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.service_args = Some(args);
        self
    }
}

// Default value functions for serde
fn default_list_distros_timeout_ms() -> u64 {
    15_000
}
fn default_warmup_timeout_ms() -> u64 {
    30_000
}
fn default_warmup_retries() -> u32 {
    3
}
fn default_warmup_retry_delay_ms() -> u64 {
    1_000
}
fn default_file_probe_timeout_ms() -> u64 {
    10_000
}
fn default_banner_retries() -> u32 {
    2
}
fn default_banner_retry_delay_ms() -> u64 {
    1_000
}
fn default_service_args() -> Vec<String> {
    vec!["--host".to_string(), "127.0.0.1".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_health_check_timeout_ms() -> u64 {
    5_000
}
fn default_health_check_retry_delay_ms() -> u64 {
    250
}
fn default_force_kill_timeout_ms() -> u64 {
    500
}
fn default_stop_timeout_ms() -> u64 {
    2_000
}
fn default_process_stopped_check_delay_ms() -> u64 {
    100
}
fn default_retry_count() -> u32 {
    3
}
