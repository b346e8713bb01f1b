use crate::errors::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Interpreter versions an environment can be built on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PythonVersion {
    #[serde(rename = "3.8")]
    V3_8,
    #[serde(rename = "3.9")]
    V3_9,
    #[serde(rename = "3.10")]
    V3_10,
    #[serde(rename = "3.11")]
    V3_11,
    #[serde(rename = "3.12")]
    V3_12,
    #[serde(rename = "3.13")]
    V3_13,
}

/// Release tag of the standalone distributions the download table points at
pub const STANDALONE_RELEASE: &str = "20241016";

impl PythonVersion {
    pub const ALL: [PythonVersion; 6] = [
        PythonVersion::V3_8,
        PythonVersion::V3_9,
        PythonVersion::V3_10,
        PythonVersion::V3_11,
        PythonVersion::V3_12,
        PythonVersion::V3_13,
    ];

    /// Major.minor form, also used as the base install directory name
    pub fn as_str(&self) -> &'static str {
        match self {
            PythonVersion::V3_8 => "3.8",
            PythonVersion::V3_9 => "3.9",
            PythonVersion::V3_10 => "3.10",
            PythonVersion::V3_11 => "3.11",
            PythonVersion::V3_12 => "3.12",
            PythonVersion::V3_13 => "3.13",
        }
    }

    /// Full patch release shipped in [`STANDALONE_RELEASE`]
    pub fn standalone_release(&self) -> &'static str {
        match self {
            PythonVersion::V3_8 => "3.8.20",
            PythonVersion::V3_9 => "3.9.20",
            PythonVersion::V3_10 => "3.10.15",
            PythonVersion::V3_11 => "3.11.10",
            PythonVersion::V3_12 => "3.12.7",
            PythonVersion::V3_13 => "3.13.0",
        }
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PythonVersion {
    type Err = HostError;

    /// Accepts `3.11`, `3.11.4`, `3.12.7.final.0` and similar; only major.minor is kept.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let mut parts = trimmed.split('.');
        let major = parts.next().unwrap_or_default();
        let minor = parts.next().unwrap_or_default();
        let key = format!("{}.{}", major, minor);
        PythonVersion::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == key)
            .ok_or_else(|| HostError::UnknownPythonVersion(trimmed.to_string()))
    }
}

/// Host-wide settings for environment management
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding base installs and named environments
    pub environments_root: PathBuf,
    /// Directory where kernel bindings are registered
    pub kernels_dir: PathBuf,
    /// Subdirectory of the root that holds base interpreter installs
    pub toolkit_name: String,
    /// Upper bound on any single subprocess, in minutes
    pub process_timeout_minutes: u64,
    /// Download location for base interpreters.
    /// `{version}`, `{release}` and `{triple}` are substituted.
    pub distribution_url: String,
    /// Use this interpreter instead of a toolkit install or download
    pub base_interpreter: Option<PathBuf>,
    /// Register a kernel binding for each created environment
    pub register_kernel: bool,
    /// Package installed alongside the requested ones when registering kernels
    pub kernel_package: String,
    /// Run `ensurepip` after creating the virtual environment
    pub initialize_package_manager: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pyhost")
            .join("envs");
        let kernels_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("jupyter")
            .join("kernels");

        Self {
            environments_root: root,
            kernels_dir,
            toolkit_name: "cpython".to_string(),
            process_timeout_minutes: 30,
            distribution_url: "https://github.com/indygreg/python-build-standalone/releases/download/{release}/cpython-{version}+{release}-{triple}-install_only.tar.gz".to_string(),
            base_interpreter: None,
            register_kernel: true,
            kernel_package: "ipykernel".to_string(),
            initialize_package_manager: true,
        }
    }
}

impl HostConfig {
    /// Defaults, then an optional JSON file, then `PYHOST_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    HostError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    HostError::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
            None => HostConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("PYHOST_ENVIRONMENTS_ROOT") {
            self.environments_root = PathBuf::from(v);
        }
        if let Some(v) = get("PYHOST_KERNELS_DIR") {
            self.kernels_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PYHOST_TOOLKIT") {
            self.toolkit_name = v;
        }
        if let Some(v) = get("PYHOST_TIMEOUT_MINUTES") {
            self.process_timeout_minutes = v.parse().map_err(|_| {
                HostError::Config(format!("PYHOST_TIMEOUT_MINUTES is not a number: {}", v))
            })?;
        }
        if let Some(v) = get("PYHOST_DISTRIBUTION_URL") {
            self.distribution_url = v;
        }
        if let Some(v) = get("PYHOST_BASE_PYTHON") {
            self.base_interpreter = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PYHOST_REGISTER_KERNEL") {
            self.register_kernel = parse_flag(&v)?;
        }
        if let Some(v) = get("PYHOST_KERNEL_PACKAGE") {
            self.kernel_package = v;
        }
        if let Some(v) = get("PYHOST_INIT_PIP") {
            self.initialize_package_manager = parse_flag(&v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.process_timeout_minutes == 0 {
            return Err(HostError::Config(
                "process timeout must be at least one minute".to_string(),
            ));
        }
        if self.toolkit_name.is_empty() || self.toolkit_name.contains(['/', '\\']) {
            return Err(HostError::Config(format!(
                "invalid toolkit name: {:?}",
                self.toolkit_name
            )));
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_minutes * 60)
    }

    /// Concrete download URL for a base interpreter on this platform
    pub fn distribution_url_for(&self, version: PythonVersion) -> String {
        self.distribution_url
            .replace("{version}", version.standalone_release())
            .replace("{release}", STANDALONE_RELEASE)
            .replace("{triple}", target_triple())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(HostError::Config(format!("not a boolean flag: {}", other))),
    }
}

/// Target triple used by the standalone distribution archives
pub fn target_triple() -> &'static str {
    if cfg!(all(target_os = "windows", target_arch = "x86_64")) {
        "x86_64-pc-windows-msvc"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "aarch64-apple-darwin"
    } else if cfg!(target_os = "macos") {
        "x86_64-apple-darwin"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64-unknown-linux-gnu"
    } else {
        "x86_64-unknown-linux-gnu"
    }
}
