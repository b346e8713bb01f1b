//! Interactive-kernel bindings for environments.

use crate::config::PythonVersion;
use crate::environment::EnvironmentLayout;
use crate::errors::Result;
use crate::fs::FileSystemGateway;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Contents of a `kernel.json` registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    pub display_name: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl KernelSpec {
    pub fn for_environment(
        name: &str,
        executable: &Path,
        version: PythonVersion,
        code_directory: Option<&Path>,
    ) -> Self {
        let mut env = BTreeMap::new();
        if let Some(dir) = code_directory {
            env.insert("PYTHONPATH".to_string(), dir.to_string_lossy().to_string());
        }
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "pyhost".to_string(),
            serde_json::json!({ "environment": name, "python_version": version }),
        );

        Self {
            argv: vec![
                executable.to_string_lossy().to_string(),
                "-m".to_string(),
                "ipykernel_launcher".to_string(),
                "-f".to_string(),
                "{connection_file}".to_string(),
            ],
            display_name: format!("Python {} ({})", version, name),
            language: "python".to_string(),
            env,
            metadata,
        }
    }
}

/// Write the kernel registration for an environment
pub fn register(
    fs: &dyn FileSystemGateway,
    layout: &EnvironmentLayout,
    name: &str,
    spec: &KernelSpec,
) -> Result<()> {
    let path = layout.kernel_spec(name);
    fs.create_dir_all(&layout.kernel_dir(name))?;
    fs.write(&path, &serde_json::to_string_pretty(spec)?)?;
    info!("[ENV] Registered kernel for '{}' at {:?}", name, path);
    Ok(())
}

/// Code directory a registration puts on `PYTHONPATH`, if any
pub fn code_directory(fs: &dyn FileSystemGateway, spec_path: &Path) -> Result<Option<PathBuf>> {
    let spec: KernelSpec = serde_json::from_str(&fs.read_to_string(spec_path)?)?;
    Ok(spec.env.get("PYTHONPATH").map(PathBuf::from))
}

/// Remove the kernel registration; a missing registration is not an error
pub fn unregister(
    fs: &dyn FileSystemGateway,
    layout: &EnvironmentLayout,
    name: &str,
) -> Result<()> {
    let dir = layout.kernel_dir(name);
    if fs.exists(&dir) {
        fs.remove_tree(&dir)?;
        info!("[ENV] Unregistered kernel for '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::fs::LocalFileSystem;

    #[test]
    fn test_register_and_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            environments_root: dir.path().join("envs"),
            kernels_dir: dir.path().join("kernels"),
            ..Default::default()
        };
        let layout = EnvironmentLayout::new(&config);
        let fs = LocalFileSystem::new();

        let spec = KernelSpec::for_environment(
            "ml",
            &layout.executable("ml"),
            PythonVersion::V3_11,
            Some(Path::new("/work/code")),
        );
        register(&fs, &layout, "ml", &spec).unwrap();

        let written: KernelSpec =
            serde_json::from_str(&std::fs::read_to_string(layout.kernel_spec("ml")).unwrap())
                .unwrap();
        assert_eq!(written, spec);
        assert_eq!(written.display_name, "Python 3.11 (ml)");
        assert_eq!(written.env.get("PYTHONPATH").unwrap(), "/work/code");
        assert_eq!(written.argv.last().unwrap(), "{connection_file}");
        assert_eq!(
            code_directory(&fs, &layout.kernel_spec("ml")).unwrap(),
            Some(PathBuf::from("/work/code"))
        );

        unregister(&fs, &layout, "ml").unwrap();
        assert!(!layout.kernel_dir("ml").exists());
        unregister(&fs, &layout, "ml").unwrap();
    }
}
