//! Reconciling a requested environment with what is on disk.
//!
//! | on disk                      | force = false            | force = true        |
//! |------------------------------|--------------------------|---------------------|
//! | absent                       | create                   | create              |
//! | present, matching            | reuse, no subprocess     | remove, then create |
//! | present, other Python        | `VersionConflict`        | remove, then create |
//! | present, package missing     | `PackageConflict`        | remove, then create |
//!
//! An environment whose creation never finished counts as absent; its
//! leftovers are cleared before creating.

use crate::config::HostConfig;
use crate::environment::{
    probe, validate_name, EnvironmentLayout, EnvironmentSpec, ExistingEnvironment, Probe,
};
use crate::errors::{HostError, Result};
use crate::fs::{FileSystemGateway, LocalFileSystem};
use crate::installer::Installer;
use crate::kernel;
use crate::process::{ProcessRunner, TokioProcessRunner};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// How an existing environment compares with a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EnvironmentState {
    Absent,
    PresentMatch,
    PresentVersionMismatch { installed: String, requested: String },
    PresentPackageMismatch { missing: String },
}

/// What `resolve` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "environment", rename_all = "snake_case")]
pub enum Resolution {
    Reused(ExistingEnvironment),
    Created(ExistingEnvironment),
    Recreated(ExistingEnvironment),
}

impl Resolution {
    pub fn environment(&self) -> &ExistingEnvironment {
        match self {
            Resolution::Reused(env) | Resolution::Created(env) | Resolution::Recreated(env) => env,
        }
    }

    pub fn into_environment(self) -> ExistingEnvironment {
        match self {
            Resolution::Reused(env) | Resolution::Created(env) | Resolution::Recreated(env) => env,
        }
    }
}

/// Compare an existing environment with a request. The Python version is
/// checked before packages; the first missing package is reported.
pub fn compare(existing: &ExistingEnvironment, spec: &EnvironmentSpec) -> EnvironmentState {
    if existing.installed_version != Some(spec.python_version()) {
        return EnvironmentState::PresentVersionMismatch {
            installed: existing.installed_version_label(),
            requested: spec.python_version().to_string(),
        };
    }
    match spec.packages().first_missing_from(&existing.installed_packages) {
        Some(missing) => EnvironmentState::PresentPackageMismatch {
            missing: missing.to_string(),
        },
        None => EnvironmentState::PresentMatch,
    }
}

/// Owns the environments under one root.
///
/// Operations on the same name are serialized within this resolver;
/// different names proceed independently.
pub struct EnvironmentResolver {
    config: HostConfig,
    layout: EnvironmentLayout,
    fs: Arc<dyn FileSystemGateway>,
    runner: Arc<dyn ProcessRunner>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvironmentResolver {
    /// Resolver on the local filesystem, spawning real processes
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_collaborators(
            config,
            Arc::new(LocalFileSystem::new()),
            Arc::new(TokioProcessRunner::new()),
        ))
    }

    pub fn with_collaborators(
        config: HostConfig,
        fs: Arc<dyn FileSystemGateway>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let layout = EnvironmentLayout::new(&config);
        Self {
            config,
            layout,
            fs,
            runner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn layout(&self) -> &EnvironmentLayout {
        &self.layout
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        self.runner.clone()
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    async fn lock_name(&self, name: &str) -> NameGuard<'_> {
        let lock = self.lock_for(name);
        let guard = lock.clone().lock_owned().await;
        NameGuard {
            resolver: self,
            name: name.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.layout.is_reserved(name) {
            return Err(HostError::InvalidName {
                name: name.to_string(),
                reason: "name is used by the environment root itself".to_string(),
            });
        }
        Ok(())
    }

    fn probe_name(&self, name: &str) -> Result<Probe> {
        probe(
            self.fs.as_ref(),
            &self.layout,
            name,
            self.config.register_kernel,
        )
    }

    /// The complete environment called `name`, if there is one
    pub fn probe(&self, name: &str) -> Result<Option<ExistingEnvironment>> {
        self.check_name(name)?;
        match self.probe_name(name)? {
            Probe::Complete(env) => Ok(Some(env)),
            Probe::Missing | Probe::Incomplete(_) => Ok(None),
        }
    }

    /// Code directory the environment was created with, as recorded in its
    /// kernel registration
    pub fn code_directory(&self, environment: &ExistingEnvironment) -> Result<Option<PathBuf>> {
        match &environment.kernel_spec {
            Some(path) => kernel::code_directory(self.fs.as_ref(), path),
            None => Ok(None),
        }
    }

    /// Classify the environment a request refers to, without changing anything
    pub fn inspect(&self, spec: &EnvironmentSpec) -> Result<EnvironmentState> {
        Ok(match self.probe(spec.name())? {
            Some(existing) => compare(&existing, spec),
            None => EnvironmentState::Absent,
        })
    }

    /// Return an environment satisfying `spec`, creating it when needed.
    ///
    /// Without `force` a mismatching environment is an error and is left
    /// untouched. With `force` any existing environment is removed first.
    pub async fn resolve(&self, spec: &EnvironmentSpec, force: bool) -> Result<Resolution> {
        let name = spec.name();
        self.check_name(name)?;
        let _guard = self.lock_name(name).await;

        match self.probe_name(name)? {
            Probe::Complete(existing) if !force => match compare(&existing, spec) {
                EnvironmentState::PresentMatch => {
                    info!("[ENV] Reusing environment '{}'", name);
                    Ok(Resolution::Reused(existing))
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
                EnvironmentState::Absent => self.create(spec).await.map(Resolution::Created),
            },
            Probe::Complete(_) => {
                info!("[ENV] Recreating environment '{}'", name);
                self.remove_unlocked(name)?;
                self.create(spec).await.map(Resolution::Recreated)
            }
            Probe::Incomplete(path) => {
                warn!("[ENV] Clearing incomplete environment at {:?}", path);
                self.remove_unlocked(name)?;
                self.create(spec).await.map(Resolution::Created)
            }
            Probe::Missing => self.create(spec).await.map(Resolution::Created),
        }
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<ExistingEnvironment> {
        Installer::new(
            &self.config,
            &self.layout,
            self.fs.as_ref(),
            self.runner.as_ref(),
        )
        .create(spec)
        .await
    }

    fn remove_unlocked(&self, name: &str) -> Result<()> {
        let dir = self.layout.environment_dir(name);
        self.fs.remove_tree(&dir)?;
        kernel::unregister(self.fs.as_ref(), &self.layout, name)?;
        info!("[ENV] Removed environment '{}'", name);
        Ok(())
    }

    /// Delete an environment and its kernel registration. Returns whether
    /// anything was there.
    pub async fn remove_environment(&self, name: &str) -> Result<bool> {
        self.check_name(name)?;
        let _guard = self.lock_name(name).await;

        let present = self.fs.exists(&self.layout.environment_dir(name))
            || self.fs.exists(&self.layout.kernel_dir(name));
        if !present {
            debug!("[ENV] Nothing to remove for '{}'", name);
            return Ok(false);
        }
        self.remove_unlocked(name)?;
        Ok(true)
    }

    /// Every complete environment under the root, sorted by name
    pub fn list_environments(&self) -> Result<Vec<ExistingEnvironment>> {
        let root = self.layout.root();
        if !self.fs.exists(root) {
            return Ok(Vec::new());
        }

        let mut environments = Vec::new();
        for path in self.fs.list_dir(root)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || self.check_name(name).is_err() {
                continue;
            }
            if let Probe::Complete(env) = self.probe_name(name)? {
                environments.push(env);
            }
        }
        Ok(environments)
    }
}

/// Exclusive hold on one environment name. The name's entry is dropped
/// from the lock table once nobody else is waiting on it.
struct NameGuard<'a> {
    resolver: &'a EnvironmentResolver,
    name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .resolver
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the table plus ours: no waiters
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.name);
        }
    }
}
