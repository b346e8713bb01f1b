//! Test doubles shared by the unit tests.

use crate::bridge::CallRequest;
use crate::config::{HostConfig, PythonVersion};
use crate::errors::{HostError, Result};
use crate::fs::{FileSystemGateway, LocalFileSystem};
use crate::process::{ProcessInvocation, ProcessOutput, ProcessRunner};
use crate::runtime::{Interpreter, RuntimeInfo};
use crate::value::{ForeignObject, ForeignValue};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Config rooted in a temp dir, with a stand-in base interpreter
pub fn test_config(root: &Path) -> HostConfig {
    let base = root.join("base").join("bin").join("python3");
    std::fs::create_dir_all(base.parent().unwrap()).unwrap();
    std::fs::write(&base, "").unwrap();
    HostConfig {
        environments_root: root.join("envs"),
        kernels_dir: root.join("kernels"),
        base_interpreter: Some(base),
        process_timeout_minutes: 1,
        ..Default::default()
    }
}

/// Ordered record of side effects, shared between doubles
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Stands in for python, pip, curl and tar by producing the files they would
pub struct FakeToolchain {
    version: PythonVersion,
    reported_version: Option<String>,
    fail_on: Option<String>,
    frozen_names: Vec<(String, String)>,
    events: EventLog,
}

impl FakeToolchain {
    pub fn new(version: PythonVersion) -> Self {
        Self {
            version,
            reported_version: None,
            fail_on: None,
            frozen_names: Vec::new(),
            events: EventLog::default(),
        }
    }

    /// Answer `--version` with `text` instead of the venv version
    pub fn reporting_version(mut self, text: &str) -> Self {
        self.reported_version = Some(text.to_string());
        self
    }

    /// Freeze reports `requested` under the project's own spelling `frozen`
    pub fn freezing_as(mut self, requested: &str, frozen: &str) -> Self {
        self.frozen_names
            .push((requested.to_string(), frozen.to_string()));
        self
    }

    /// Fail any invocation carrying `arg`
    pub fn failing_on(mut self, arg: &str) -> Self {
        self.fail_on = Some(arg.to_string());
        self
    }

    pub fn with_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Steps run so far, e.g. `venv`, `pip install`
    pub fn steps(&self) -> Vec<String> {
        self.events
            .snapshot()
            .into_iter()
            .filter_map(|e| e.strip_prefix("run ").map(str::to_string))
            .collect()
    }

    fn step_name(invocation: &ProcessInvocation) -> String {
        let program = invocation.program_name();
        if program == "curl" || program == "tar" {
            return program;
        }
        for (arg, step) in [
            ("--version", "python --version"),
            ("venv", "venv"),
            ("ensurepip", "ensurepip"),
            ("install", "pip install"),
            ("freeze", "pip freeze"),
        ] {
            if invocation.has_arg(arg) {
                return step.to_string();
            }
        }
        invocation.display()
    }
}

fn ok(stdout: String) -> ProcessOutput {
    ProcessOutput {
        code: Some(0),
        success: true,
        stdout,
        stderr: String::new(),
    }
}

#[async_trait]
impl ProcessRunner for FakeToolchain {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ProcessOutput> {
        let step = Self::step_name(invocation);
        self.events.push(format!("run {}", step));

        if let Some(arg) = &self.fail_on {
            if invocation.has_arg(arg) {
                return Ok(ProcessOutput {
                    code: Some(1),
                    success: false,
                    stdout: String::new(),
                    stderr: "ERROR: No matching distribution found".to_string(),
                });
            }
        }

        let last_arg = invocation.args.last().map(PathBuf::from);
        match step.as_str() {
            "tar" => {
                let dest = last_arg.unwrap();
                let python = if cfg!(windows) {
                    dest.join("python").join("python.exe")
                } else {
                    dest.join("python").join("bin").join("python3")
                };
                std::fs::create_dir_all(python.parent().unwrap())?;
                std::fs::write(python, "")?;
            }
            "venv" => {
                let env_dir = last_arg.unwrap();
                let python = if cfg!(windows) {
                    env_dir.join("Scripts").join("python.exe")
                } else {
                    env_dir.join("bin").join("python")
                };
                std::fs::create_dir_all(python.parent().unwrap())?;
                std::fs::write(python, "")?;
                std::fs::write(
                    env_dir.join("pyvenv.cfg"),
                    format!("home = /base\nversion = {}\n", self.version.standalone_release()),
                )?;
            }
            "python --version" => {
                let reported = self
                    .reported_version
                    .clone()
                    .unwrap_or_else(|| format!("Python {}", self.version.standalone_release()));
                return Ok(ok(format!("{}\n", reported)));
            }
            "pip freeze" => {
                let env_dir = invocation.program.parent().and_then(Path::parent).unwrap();
                let mut frozen =
                    std::fs::read_to_string(env_dir.join("requirements.in")).unwrap_or_default();
                for (requested, spelling) in &self.frozen_names {
                    frozen = frozen.replace(&format!("{}==", requested), &format!("{}==", spelling));
                }
                return Ok(ok(format!("{}ipykernel==6.29.5\n", frozen)));
            }
            _ => {}
        }
        Ok(ok(String::new()))
    }
}

/// Local filesystem that records removals
pub struct RecordingFs {
    inner: LocalFileSystem,
    events: EventLog,
    fail_removals: bool,
}

impl RecordingFs {
    pub fn new(events: EventLog) -> Self {
        Self {
            inner: LocalFileSystem::new(),
            events,
            fail_removals: false,
        }
    }

    /// Every removal fails as if a file were locked
    pub fn failing_removals(mut self) -> Self {
        self.fail_removals = true;
        self
    }
}

impl FileSystemGateway for RecordingFs {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.inner.is_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.inner.read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        self.inner.write(path, contents)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_dir(path)
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.events.push(format!("remove {}", path.display()));
        if self.fail_removals {
            return Err(HostError::RemovalFailure {
                path: path.to_path_buf(),
                message: "file is in use by another process".to_string(),
            });
        }
        self.inner.remove_tree(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }
}

/// Interpreter that records requests and answers with a fixed object
pub struct ScriptedInterpreter {
    result: ForeignObject,
    start_error: Option<String>,
    starts: AtomicUsize,
    calls: Mutex<Vec<CallRequest>>,
}

impl ScriptedInterpreter {
    pub fn returning(value: ForeignValue) -> Self {
        Self {
            result: ForeignObject::from(value),
            start_error: None,
            starts: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_start(reason: &str) -> Self {
        Self {
            start_error: Some(reason.to_string()),
            ..Self::returning(ForeignValue::None)
        }
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn start(&self) -> Result<RuntimeInfo> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match &self.start_error {
            Some(reason) => Err(HostError::SubprocessFailure {
                program: "python".to_string(),
                code: None,
                stderr: reason.clone(),
            }),
            None => Ok(RuntimeInfo {
                version: "3.11.10".to_string(),
                executable: PathBuf::from("/scripted/python"),
            }),
        }
    }

    async fn call(&self, request: &CallRequest) -> Result<ForeignObject> {
        self.calls.lock().unwrap().push(request.clone());
        Ok(self.result.clone())
    }
}
