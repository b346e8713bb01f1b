//! Environment identity: what a caller asks for, where it lives on disk,
//! and what is actually there.

use crate::config::{HostConfig, PythonVersion};
use crate::errors::{HostError, Result};
use crate::fs::FileSystemGateway;
use crate::package::{PackageSet, PackageSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Requested packages file consumed by `pip install -r`
pub const REQUESTED_FILE: &str = "requirements.in";
/// Frozen package manifest, written once the environment is complete
pub const MANIFEST_FILE: &str = "requirements.txt";

/// Characters rejected in environment names on every platform
const ILLEGAL_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A validated request for a named environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    name: String,
    python_version: PythonVersion,
    packages: PackageSet,
    code_directory: Option<PathBuf>,
}

impl EnvironmentSpec {
    /// Validate the name and require every package to be pinned (`name==version`).
    pub fn new<I, S>(
        name: impl Into<String>,
        python_version: PythonVersion,
        packages: I,
        code_directory: Option<PathBuf>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.into();
        validate_name(&name)?;
        let packages = PackageSet::parse(packages)?;
        Ok(Self {
            name,
            python_version,
            packages,
            code_directory,
        })
    }

    /// Build from already-pinned package specs
    pub fn with_packages(
        name: impl Into<String>,
        python_version: PythonVersion,
        packages: PackageSet,
        code_directory: Option<PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            python_version,
            packages,
            code_directory,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn python_version(&self) -> PythonVersion {
        self.python_version
    }

    pub fn packages(&self) -> &PackageSet {
        &self.packages
    }

    pub fn code_directory(&self) -> Option<&Path> {
        self.code_directory.as_deref()
    }
}

/// Reject names that contain whitespace or cannot be a directory name
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| HostError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name contains whitespace"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || ILLEGAL_NAME_CHARS.contains(c))
    {
        return Err(invalid(&format!("character {:?} is not allowed in a path", c)));
    }
    if name == "." || name == ".." || name.ends_with('.') {
        return Err(invalid("name cannot end with '.'"));
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return Err(invalid("name is reserved by the operating system"));
    }
    Ok(())
}

/// Conventional on-disk locations
#[derive(Debug, Clone)]
pub struct EnvironmentLayout {
    root: PathBuf,
    kernels_dir: PathBuf,
    toolkit_name: String,
}

impl EnvironmentLayout {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            root: config.environments_root.clone(),
            kernels_dir: config.kernels_dir.clone(),
            toolkit_name: config.toolkit_name.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<toolkit>/`
    pub fn toolkit_dir(&self) -> PathBuf {
        self.root.join(&self.toolkit_name)
    }

    /// `<root>/<toolkit>/<version>/`
    pub fn base_install_dir(&self, version: PythonVersion) -> PathBuf {
        self.toolkit_dir().join(version.as_str())
    }

    /// The interpreter inside a base install
    pub fn base_executable(&self, version: PythonVersion) -> PathBuf {
        let dir = self.base_install_dir(version);
        if cfg!(windows) {
            dir.join("python.exe")
        } else {
            dir.join("bin").join("python3")
        }
    }

    /// `<root>/<env-name>/`
    pub fn environment_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The interpreter inside a virtual environment
    pub fn executable(&self, name: &str) -> PathBuf {
        let dir = self.environment_dir(name);
        if cfg!(windows) {
            dir.join("Scripts").join("python.exe")
        } else {
            dir.join("bin").join("python")
        }
    }

    pub fn pyvenv_cfg(&self, name: &str) -> PathBuf {
        self.environment_dir(name).join("pyvenv.cfg")
    }

    pub fn requested_file(&self, name: &str) -> PathBuf {
        self.environment_dir(name).join(REQUESTED_FILE)
    }

    pub fn manifest_file(&self, name: &str) -> PathBuf {
        self.environment_dir(name).join(MANIFEST_FILE)
    }

    pub fn kernel_dir(&self, name: &str) -> PathBuf {
        self.kernels_dir.join(name)
    }

    pub fn kernel_spec(&self, name: &str) -> PathBuf {
        self.kernel_dir(name).join("kernel.json")
    }

    /// Names that would collide with the layout's own directories
    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.toolkit_name || name.starts_with(".pyhost")
    }
}

/// What probing found on disk for one environment name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingEnvironment {
    pub name: String,
    pub root: PathBuf,
    pub executable_path: PathBuf,
    pub installed_packages: PackageSet,
    /// `None` when `pyvenv.cfg` is missing or unreadable
    pub installed_version: Option<PythonVersion>,
    pub kernel_spec: Option<PathBuf>,
}

impl ExistingEnvironment {
    pub fn has_package(&self, spec: &PackageSpec) -> bool {
        self.installed_packages.contains(spec)
    }

    pub fn installed_version_label(&self) -> String {
        self.installed_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Outcome of looking for an environment on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Nothing at the environment's location
    Missing,
    /// Something is there, but creation never finished
    Incomplete(PathBuf),
    Complete(ExistingEnvironment),
}

/// Inspect the filesystem for `name`. Never cached: every call re-reads.
pub fn probe(
    fs: &dyn FileSystemGateway,
    layout: &EnvironmentLayout,
    name: &str,
    require_kernel: bool,
) -> Result<Probe> {
    let root = layout.environment_dir(name);
    if !fs.exists(&root) {
        return Ok(Probe::Missing);
    }

    let executable_path = layout.executable(name);
    let manifest = layout.manifest_file(name);
    let kernel_spec = layout.kernel_spec(name);
    let kernel_present = fs.is_file(&kernel_spec);

    if !fs.is_file(&executable_path) || !fs.is_file(&manifest) {
        debug!("[ENV] {:?} exists but has no interpreter or manifest", root);
        return Ok(Probe::Incomplete(root));
    }
    if require_kernel && !kernel_present {
        debug!("[ENV] {:?} has no kernel registration", root);
        return Ok(Probe::Incomplete(root));
    }

    let installed_packages = PackageSet::from_requirements(&fs.read_to_string(&manifest)?);
    let installed_version = fs
        .read_to_string(&layout.pyvenv_cfg(name))
        .ok()
        .and_then(|cfg| parse_pyvenv_version(&cfg));

    Ok(Probe::Complete(ExistingEnvironment {
        name: name.to_string(),
        root,
        executable_path,
        installed_packages,
        installed_version,
        kernel_spec: kernel_present.then_some(kernel_spec),
    }))
}

/// Interpreter version recorded in `pyvenv.cfg` (`version` or `version_info`)
pub fn parse_pyvenv_version(content: &str) -> Option<PythonVersion> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        match key.trim() {
            "version" | "version_info" => value.trim().parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;

    fn layout(root: &Path) -> EnvironmentLayout {
        let config = HostConfig {
            environments_root: root.join("envs"),
            kernels_dir: root.join("kernels"),
            ..Default::default()
        };
        EnvironmentLayout::new(&config)
    }

    #[test]
    fn test_spec_requires_pinned_packages() {
        let result = EnvironmentSpec::new("analysis", PythonVersion::V3_11, ["numpy"], None);
        assert!(matches!(result, Err(HostError::UnpinnedPackage(name)) if name == "numpy"));

        let spec =
            EnvironmentSpec::new("analysis", PythonVersion::V3_11, ["numpy==1.24.0"], None)
                .unwrap();
        assert_eq!(spec.packages().len(), 1);
        assert_eq!(spec.name(), "analysis");
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "my env", "tab\tname", "a/b", "a\\b", "what?", "..", "trail.", "CON", "nul.txt"] {
            let result = EnvironmentSpec::new(name, PythonVersion::V3_12, Vec::<&str>::new(), None);
            assert!(
                matches!(result, Err(HostError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
        for name in ["analysis", "ml-2024", "team_a.v2", "console"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn test_name_checked_before_packages() {
        let result = EnvironmentSpec::new("bad name", PythonVersion::V3_12, ["numpy"], None);
        assert!(matches!(result, Err(HostError::InvalidName { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_layout_paths() {
        let layout = layout(Path::new("/data"));
        assert_eq!(
            layout.base_install_dir(PythonVersion::V3_10),
            PathBuf::from("/data/envs/cpython/3.10")
        );
        assert_eq!(layout.environment_dir("ml"), PathBuf::from("/data/envs/ml"));
        assert_eq!(
            layout.kernel_spec("ml"),
            PathBuf::from("/data/kernels/ml/kernel.json")
        );
        assert!(layout.is_reserved("cpython"));
        assert!(!layout.is_reserved("ml"));
    }

    #[test]
    fn test_pyvenv_version_parsing() {
        let cfg = "home = /usr/bin\ninclude-system-site-packages = false\nversion = 3.11.4\n";
        assert_eq!(parse_pyvenv_version(cfg), Some(PythonVersion::V3_11));
        let uv_cfg = "home = /opt/python/bin\nimplementation = CPython\nversion_info = 3.12.7\n";
        assert_eq!(parse_pyvenv_version(uv_cfg), Some(PythonVersion::V3_12));
        assert_eq!(parse_pyvenv_version("home = /usr/bin\n"), None);
    }

    #[test]
    fn test_probe_states() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let fs = LocalFileSystem::new();

        assert_eq!(probe(&fs, &layout, "ml", true).unwrap(), Probe::Missing);

        std::fs::create_dir_all(layout.environment_dir("ml")).unwrap();
        assert!(matches!(
            probe(&fs, &layout, "ml", true).unwrap(),
            Probe::Incomplete(_)
        ));

        fs.write(&layout.executable("ml"), "").unwrap();
        fs.write(&layout.pyvenv_cfg("ml"), "version = 3.11.9\n").unwrap();
        fs.write(&layout.manifest_file("ml"), "numpy==1.24.0\n").unwrap();
        assert!(matches!(
            probe(&fs, &layout, "ml", true).unwrap(),
            Probe::Incomplete(_)
        ));

        fs.write(&layout.kernel_spec("ml"), "{}").unwrap();
        match probe(&fs, &layout, "ml", true).unwrap() {
            Probe::Complete(env) => {
                assert_eq!(env.installed_version, Some(PythonVersion::V3_11));
                assert!(env.has_package(&"numpy==1.24.0".parse().unwrap()));
                assert!(env.kernel_spec.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
