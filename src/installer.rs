//! Environment creation: base interpreter, virtual environment, packages,
//! frozen manifest and kernel registration, in that order.

use crate::config::{HostConfig, PythonVersion};
use crate::environment::{probe, EnvironmentLayout, EnvironmentSpec, ExistingEnvironment, Probe};
use crate::errors::{HostError, Result};
use crate::fs::FileSystemGateway;
use crate::kernel::{self, KernelSpec};
use crate::process::{ProcessInvocation, ProcessOutput, ProcessRunner};
use crate::resolver::{compare, EnvironmentState};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Builds environments on disk
pub struct Installer<'a> {
    config: &'a HostConfig,
    layout: &'a EnvironmentLayout,
    fs: &'a dyn FileSystemGateway,
    runner: &'a dyn ProcessRunner,
}

impl<'a> Installer<'a> {
    pub fn new(
        config: &'a HostConfig,
        layout: &'a EnvironmentLayout,
        fs: &'a dyn FileSystemGateway,
        runner: &'a dyn ProcessRunner,
    ) -> Self {
        Self {
            config,
            layout,
            fs,
            runner,
        }
    }

    async fn run(&self, step: &str, invocation: ProcessInvocation) -> Result<ProcessOutput> {
        debug!("[ENV] {}: {}", step, invocation.display());
        self.runner.run(&invocation).await?.into_success(step)
    }

    fn invocation(&self, program: impl Into<PathBuf>) -> ProcessInvocation {
        ProcessInvocation::new(program, self.config.process_timeout())
    }

    /// Interpreter used to create virtual environments for `version`:
    /// the configured override, else the toolkit install, downloading it
    /// first when missing.
    pub async fn ensure_base_interpreter(&self, version: PythonVersion) -> Result<PathBuf> {
        if let Some(path) = &self.config.base_interpreter {
            if !self.fs.is_file(path) {
                return Err(HostError::PythonNotFound);
            }
            return Ok(path.clone());
        }

        let executable = self.layout.base_executable(version);
        if self.fs.is_file(&executable) {
            debug!("[ENV] Using installed Python {} at {:?}", version, executable);
            return Ok(executable);
        }

        self.download_base_interpreter(version).await?;
        if !self.fs.is_file(&executable) {
            return Err(HostError::SubprocessFailure {
                program: "tar".to_string(),
                code: None,
                stderr: format!("archive did not provide {}", executable.display()),
            });
        }
        Ok(executable)
    }

    async fn download_base_interpreter(&self, version: PythonVersion) -> Result<()> {
        let toolkit = self.layout.toolkit_dir();
        self.fs.create_dir_all(&toolkit)?;
        // Extract beside the final location so the move is a rename
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&toolkit)?;
        let archive = staging.path().join("python.tar.gz");
        let url = self.config.distribution_url_for(version);

        info!("[ENV] Downloading Python {} from {}", version, url);
        self.run(
            "curl",
            self.invocation("curl")
                .args(["-fsSL", "-o"])
                .arg(&archive)
                .arg(&url),
        )
        .await?;

        self.run(
            "tar",
            self.invocation("tar")
                .arg("-xzf")
                .arg(&archive)
                .arg("-C")
                .arg(staging.path()),
        )
        .await?;

        let extracted = staging.path().join("python");
        if !self.fs.exists(&extracted) {
            return Err(HostError::SubprocessFailure {
                program: "tar".to_string(),
                code: None,
                stderr: format!("{} has no python/ directory", url),
            });
        }
        let target = self.layout.base_install_dir(version);
        self.fs.rename(&extracted, &target)?;
        info!("[ENV] Installed Python {} at {:?}", version, target);
        Ok(())
    }

    /// Fail unless `python` reports the requested minor version
    async fn check_interpreter_version(
        &self,
        name: &str,
        python: &Path,
        version: PythonVersion,
    ) -> Result<()> {
        let output = self
            .run("python --version", self.invocation(python).arg("--version"))
            .await?;
        let text = if output.stdout.trim().is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        let reported = text.trim().trim_start_matches("Python").trim();
        match reported.parse::<PythonVersion>() {
            Ok(found) if found == version => Ok(()),
            found => Err(HostError::VersionConflict {
                name: name.to_string(),
                installed: found
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| reported.to_string()),
                requested: version.to_string(),
            }),
        }
    }

    /// Create the environment from scratch. The target directory must not exist.
    ///
    /// The result always matches `spec`; a base interpreter of another
    /// version is refused before anything is written.
    pub async fn create(&self, spec: &EnvironmentSpec) -> Result<ExistingEnvironment> {
        let name = spec.name();
        let version = spec.python_version();
        let base = self.ensure_base_interpreter(version).await?;
        self.check_interpreter_version(name, &base, version).await?;
        let env_dir = self.layout.environment_dir(name);
        self.fs.create_dir_all(self.layout.root())?;

        info!("[ENV] Creating environment '{}' with Python {}", name, version);
        self.run(
            "venv",
            self.invocation(&base).args(["-m", "venv"]).arg(&env_dir),
        )
        .await?;

        let python = self.layout.executable(name);
        if self.config.initialize_package_manager {
            self.run(
                "ensurepip",
                self.invocation(&python)
                    .args(["-m", "ensurepip", "--upgrade"]),
            )
            .await?;
        }

        let requested = self.layout.requested_file(name);
        self.fs.write(&requested, &spec.packages().to_requirements())?;
        self.install_packages(spec, &python, &requested).await?;

        let frozen = self
            .run(
                "pip freeze",
                self.invocation(&python)
                    .args(["-m", "pip", "freeze", "--disable-pip-version-check"]),
            )
            .await?;
        self.fs.write(&self.layout.manifest_file(name), &frozen.stdout)?;

        if self.config.register_kernel {
            let kernel = KernelSpec::for_environment(name, &python, version, spec.code_directory());
            kernel::register(self.fs, self.layout, name, &kernel)?;
        }

        match probe(self.fs, self.layout, name, self.config.register_kernel)? {
            Probe::Complete(environment) => match compare(&environment, spec) {
                EnvironmentState::PresentMatch => {
                    info!(
                        "[ENV] Environment '{}' ready with {} packages",
                        name,
                        environment.installed_packages.len()
                    );
                    Ok(environment)
                }
                EnvironmentState::PresentVersionMismatch {
                    installed,
                    requested,
                } => Err(HostError::VersionConflict {
                    name: name.to_string(),
                    installed,
                    requested,
                }),
                EnvironmentState::PresentPackageMismatch { missing } => {
                    Err(HostError::PackageConflict {
                        environment: name.to_string(),
                        package: missing,
                    })
                }
                EnvironmentState::Absent => Err(HostError::SubprocessFailure {
                    program: "venv".to_string(),
                    code: None,
                    stderr: format!("{:?} is missing after creation", env_dir),
                }),
            },
            _ => Err(HostError::SubprocessFailure {
                program: "venv".to_string(),
                code: None,
                stderr: format!("{:?} is incomplete after creation", env_dir),
            }),
        }
    }

    async fn install_packages(
        &self,
        spec: &EnvironmentSpec,
        python: &Path,
        requested: &Path,
    ) -> Result<()> {
        let with_kernel = self.config.register_kernel && !self.config.kernel_package.is_empty();
        if spec.packages().is_empty() && !with_kernel {
            debug!("[ENV] No packages requested for '{}'", spec.name());
            return Ok(());
        }

        let mut invocation = self.invocation(python).args([
            "-m",
            "pip",
            "install",
            "--disable-pip-version-check",
            "--no-input",
            "-r",
        ]);
        invocation = invocation.arg(requested);
        if with_kernel {
            invocation = invocation.arg(&self.config.kernel_package);
        }
        info!(
            "[ENV] Installing {} packages into '{}'",
            spec.packages().len(),
            spec.name()
        );
        self.run("pip install", invocation).await?;
        Ok(())
    }
}
