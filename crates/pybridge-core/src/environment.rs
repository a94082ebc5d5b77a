use crate::error::{BridgeError, Result};
use crate::paths::compat_to_native_unc;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Name given to the root prefix reported by `info --json`
pub const BASE_ENVIRONMENT: &str = "base";

/// A named package environment. `compat_distro == None` means native.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,
    pub install_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat_distro: Option<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>, install_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            install_path: install_path.into(),
            compat_distro: None,
        }
    }

    pub fn in_distro(
        name: impl Into<String>,
        install_path: impl Into<String>,
        distro: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            install_path: install_path.into(),
            compat_distro: Some(distro.into()),
        }
    }

    pub fn is_compat(&self) -> bool {
        self.compat_distro.is_some()
    }

    /// Case-insensitive name comparison
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// The install path as the host sees it: unchanged for native environments,
    /// a `\\wsl$\` UNC path for environments under `/home/` in a distro.
    pub fn host_visible_path(&self) -> Result<String> {
        match &self.compat_distro {
            None => Ok(self.install_path.clone()),
            Some(distro) => compat_to_native_unc(distro, &self.install_path),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.compat_distro {
            Some(distro) => write!(f, "{} ({}) [WSL: {distro}]", self.name, self.install_path),
            None => write!(f, "{} ({})", self.name, self.install_path),
        }
    }
}

/// Ordered environments for one execution context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentCatalog {
    distro: Option<String>,
    environments: Vec<Environment>,
}

impl EnvironmentCatalog {
    pub fn new(distro: Option<String>, environments: Vec<Environment>) -> Self {
        Self {
            distro,
            environments,
        }
    }

    pub fn distro(&self) -> Option<&str> {
        self.distro.as_deref()
    }

    /// First entry belonging to this catalog's own context. For the native
    /// catalog that is the first entry without a distro.
    pub fn base(&self) -> Option<&Environment> {
        self.environments
            .iter()
            .find(|env| env.compat_distro == self.distro)
    }

    pub fn find(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|env| env.matches(name))
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Environment> {
        self.environments.iter()
    }

    pub fn to_vec(&self) -> Vec<Environment> {
        self.environments.clone()
    }
}

impl<'a> IntoIterator for &'a EnvironmentCatalog {
    type Item = &'a Environment;
    type IntoIter = std::slice::Iter<'a, Environment>;

    fn into_iter(self) -> Self::IntoIter {
        self.environments.iter()
    }
}

/// A WSL distribution as listed by `wsl -l -v`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatDistro {
    pub name: String,
    pub is_default: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: u8,
}

/// Parsed distro listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistroList {
    pub distros: Vec<CompatDistro>,
}

impl DistroList {
    pub fn default_distro(&self) -> Option<&CompatDistro> {
        self.distros.iter().find(|d| d.is_default)
    }

    pub fn find(&self, name: &str) -> Option<&CompatDistro> {
        self.distros.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.distros.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    default_prefix: Option<String>,
    #[serde(default)]
    envs: Option<Vec<Option<String>>>,
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}

/// Parse `<mgr> info --json` into a catalog.
///
/// The root prefix becomes `base`; every other entry of `envs` is named after
/// its last path segment. Missing or null fields yield fewer entries, not an error.
/// Anything printed before the first `{` (shell banners, activation noise) is skipped.
pub fn parse_info_json(stdout: &str, distro: Option<&str>) -> Result<EnvironmentCatalog> {
    let start = stdout
        .find('{')
        .ok_or_else(|| BridgeError::UnexpectedOutput {
            command: "info --json".to_string(),
            detail: "no JSON object in output".to_string(),
        })?;
    let info: InfoJson =
        serde_json::from_str(stdout[start..].trim_end()).map_err(|e| BridgeError::UnexpectedOutput {
            command: "info --json".to_string(),
            detail: format!("{e}: {}", stdout.trim()),
        })?;

    let make = |name: &str, path: &str| match distro {
        Some(d) => Environment::in_distro(name, path, d),
        None => Environment::new(name, path),
    };

    let mut environments = Vec::new();
    match info.default_prefix.as_deref() {
        Some(root) => {
            debug!(path = %root, "Found root environment");
            environments.push(make(BASE_ENVIRONMENT, root));
        }
        None => warn!("default_prefix missing or null in info output"),
    }

    match info.envs {
        Some(envs) => {
            for path in envs.into_iter().flatten() {
                if info.default_prefix.as_deref() == Some(path.as_str()) {
                    continue;
                }
                let name = last_segment(&path);
                debug!(name = %name, path = %path, "Found environment");
                environments.push(make(name, &path));
            }
        }
        None => warn!("envs missing or null in info output"),
    }

    Ok(EnvironmentCatalog::new(distro.map(str::to_string), environments))
}

/// Parse `wsl -l -v` output, already decoded to text.
///
/// ```text
///   NAME            STATE           VERSION
/// * Ubuntu-22.04    Running         2
///   docker-desktop  Stopped         2
/// ```
pub fn parse_distro_list(text: &str) -> DistroList {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\0' && *c != '\u{feff}')
        .collect();

    let distros = cleaned
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let (is_default, rest) = match line.strip_prefix('*') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let mut columns = rest.split_whitespace();
            let name = columns.next()?;
            let state = columns.next()?;
            let version = columns.next()?.parse::<u8>().ok()?;
            Some(CompatDistro {
                name: name.to_string(),
                is_default,
                state: state.to_string(),
                version,
            })
        })
        .collect();

    DistroList { distros }
}
