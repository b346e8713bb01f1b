//! The interpreter runtime behind the bridge.
//!
//! [`RuntimeHandle`] is the explicit lifecycle object: it must be
//! initialized before any call is made, and a handle whose initialization
//! failed stays failed. [`PythonInterpreter`] runs each call in a fresh
//! interpreter process inside an environment.

use crate::bridge::CallRequest;
use crate::config::HostConfig;
use crate::environment::ExistingEnvironment;
use crate::errors::{HostError, Result};
use crate::process::{ProcessInvocation, ProcessRunner};
use crate::value::ForeignObject;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// What a started interpreter reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub version: String,
    pub executable: PathBuf,
}

/// An interpreter that can resolve and call functions by dotted name
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Verify the interpreter can run at all
    async fn start(&self) -> Result<RuntimeInfo>;

    async fn call(&self, request: &CallRequest) -> Result<ForeignObject>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Ready(RuntimeInfo),
    /// Initialization failed; the handle cannot be reused
    Failed(String),
}

/// Lifecycle wrapper around an [`Interpreter`]
pub struct RuntimeHandle {
    interpreter: Arc<dyn Interpreter>,
    state: RuntimeState,
}

impl RuntimeHandle {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            interpreter,
            state: RuntimeState::Uninitialized,
        }
    }

    /// Handle for an environment's interpreter, with its code directory importable
    pub fn for_environment(
        environment: &ExistingEnvironment,
        code_directory: Option<&Path>,
        runner: Arc<dyn ProcessRunner>,
        config: &HostConfig,
    ) -> Self {
        let mut interpreter = PythonInterpreter::new(
            environment.executable_path.clone(),
            runner,
            config.process_timeout(),
        );
        if let Some(dir) = code_directory {
            interpreter = interpreter.with_code_directory(dir);
        }
        Self::new(Arc::new(interpreter))
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, RuntimeState::Ready(_))
    }

    /// Start the interpreter once. Repeated calls on a ready handle are
    /// no-ops; a failed handle reports its original failure.
    pub async fn initialize(&mut self) -> Result<&RuntimeInfo> {
        if let RuntimeState::Failed(reason) = &self.state {
            return Err(HostError::RuntimeUnavailable(reason.clone()));
        }
        if self.state == RuntimeState::Uninitialized {
            match self.interpreter.start().await {
                Ok(info) => {
                    info!(
                        "[RUNTIME] Interpreter ready: Python {} at {:?}",
                        info.version, info.executable
                    );
                    self.state = RuntimeState::Ready(info);
                }
                Err(e) => {
                    error!("[RUNTIME] Interpreter failed to start: {}", e);
                    let reason = e.to_string();
                    self.state = RuntimeState::Failed(reason.clone());
                    return Err(HostError::RuntimeUnavailable(reason));
                }
            }
        }
        match &self.state {
            RuntimeState::Ready(info) => Ok(info),
            _ => Err(HostError::RuntimeUnavailable(
                "runtime not initialized".to_string(),
            )),
        }
    }

    pub(crate) fn ready_interpreter(&self) -> Result<&dyn Interpreter> {
        match &self.state {
            RuntimeState::Ready(_) => Ok(self.interpreter.as_ref()),
            RuntimeState::Uninitialized => Err(HostError::RuntimeUnavailable(
                "runtime not initialized".to_string(),
            )),
            RuntimeState::Failed(reason) => Err(HostError::RuntimeUnavailable(reason.clone())),
        }
    }
}

const MARKER_START: &str = "OUTPUT_JSON_START";
const MARKER_END: &str = "OUTPUT_JSON_END";

const PROBE_SCRIPT: &str = r#"import json, sys
print(json.dumps({"version": "%d.%d.%d" % tuple(sys.version_info[:3]), "executable": sys.executable}))
"#;

/// Reads a call request on stdin, resolves the target, calls it and writes a
/// description of the result between markers. User output is captured so it
/// cannot corrupt the response.
const BRIDGE_SCRIPT: &str = r#"
import collections.abc
import importlib
import io
import json
import math
import numbers
import sys
import traceback
import types

INT32 = (-(2 ** 31), 2 ** 31 - 1)
INT64 = (-(2 ** 63), 2 ** 63 - 1)
MAX_DEPTH = 100


def build(node):
    tag = node["t"]
    value = node.get("v")
    if tag == "none":
        return None
    if tag == "float":
        return float(value)
    if tag in ("int", "long", "str", "bool"):
        return value
    if tag == "list":
        return [build(item) for item in value]
    if tag == "tuple":
        return tuple(build(item) for item in value)
    if tag == "map":
        return {build(k): build(v) for k, v in value}
    raise TypeError("unknown value tag %r" % (tag,))


def wire_float(value):
    if math.isnan(value):
        return "nan"
    if math.isinf(value):
        return "inf" if value > 0 else "-inf"
    return value


def safe_repr(obj):
    try:
        text = repr(obj)
    except Exception:
        text = "<unrepresentable>"
    return text if len(text) <= 200 else text[:197] + "..."


def describe(obj, depth=0):
    node = {"type": type(obj).__name__, "repr": safe_repr(obj)}
    if depth > MAX_DEPTH:
        return node
    if obj is None:
        node["none"] = True
        return node
    if isinstance(obj, bool):
        node["bool"] = obj
        node["number"] = float(obj)
        return node
    if isinstance(obj, numbers.Integral):
        value = int(obj)
        if INT32[0] <= value <= INT32[1]:
            node["int"] = value
        elif INT64[0] <= value <= INT64[1]:
            node["long"] = value
    elif isinstance(obj, float):
        node["float"] = wire_float(float(obj))
    elif isinstance(obj, str):
        node["str"] = obj
    elif isinstance(obj, list):
        node["list"] = [describe(item, depth + 1) for item in obj]
    elif isinstance(obj, collections.abc.Mapping):
        node["dict"] = [[describe(k, depth + 1), describe(v, depth + 1)] for k, v in obj.items()]
    elif isinstance(obj, tuple):
        node["tuple"] = [describe(item, depth + 1) for item in obj]
    elif isinstance(obj, collections.abc.Iterable) and not isinstance(obj, types.ModuleType):
        node["iter"] = [describe(item, depth + 1) for item in obj]
    if isinstance(obj, numbers.Number):
        try:
            node["number"] = wire_float(float(obj))
        except (TypeError, ValueError, OverflowError):
            pass
    return node


def resolve(target):
    parts = target.split(".")
    obj = importlib.import_module(parts[0])
    path = parts[0]
    for part in parts[1:]:
        path = path + "." + part
        try:
            obj = getattr(obj, part)
        except AttributeError:
            if not isinstance(obj, types.ModuleType):
                raise
            obj = importlib.import_module(path)
    return obj


def main():
    request = json.loads(sys.stdin.read())
    real_out, real_err = sys.stdout, sys.stderr
    captured_out, captured_err = io.StringIO(), io.StringIO()
    sys.stdout, sys.stderr = captured_out, captured_err
    stage = "resolve"
    try:
        func = resolve(request["target"])
        stage = "call"
        call = request["call"]
        if call["shape"] == "no_args":
            result = func()
        else:
            args = []
            if call.get("positional") is not None:
                args.append(build(call["positional"]))
            kwargs = {k: build(v) for k, v in call.get("keywords", {}).items()}
            result = func(*args, **kwargs)
        stage = "describe"
        response = {"ok": True, "result": describe(result)}
    except BaseException as exc:
        response = {
            "ok": False,
            "stage": stage,
            "error": "%s: %s" % (type(exc).__name__, exc),
            "traceback": traceback.format_exc(),
        }
    finally:
        sys.stdout, sys.stderr = real_out, real_err
    response["stdout"] = captured_out.getvalue()
    response["stderr"] = captured_err.getvalue()
    sys.stdout.write("OUTPUT_JSON_START\n" + json.dumps(response, allow_nan=False) + "\nOUTPUT_JSON_END\n")
    sys.stdout.flush()


main()
"#;

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    result: Option<ForeignObject>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// A CPython interpreter run as a subprocess, one process per call
pub struct PythonInterpreter {
    executable: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    timeout: Duration,
    code_directory: Option<PathBuf>,
}

impl PythonInterpreter {
    pub fn new(executable: PathBuf, runner: Arc<dyn ProcessRunner>, timeout: Duration) -> Self {
        Self {
            executable,
            runner,
            timeout,
            code_directory: None,
        }
    }

    /// Make modules in `dir` importable and run calls from there
    pub fn with_code_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.code_directory = Some(dir.into());
        self
    }

    fn invocation(&self, script: &str) -> ProcessInvocation {
        let mut invocation = ProcessInvocation::new(&self.executable, self.timeout)
            .arg("-c")
            .arg(script)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1");
        if let Some(dir) = &self.code_directory {
            invocation = invocation
                .env("PYTHONPATH", dir.to_string_lossy())
                .current_dir(dir);
        }
        invocation
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    async fn start(&self) -> Result<RuntimeInfo> {
        let output = self
            .runner
            .run(&self.invocation(PROBE_SCRIPT))
            .await?
            .into_success("python")?;
        serde_json::from_str(output.stdout.trim()).map_err(|e| {
            HostError::RuntimeUnavailable(format!(
                "unexpected interpreter probe output ({}): {}",
                e,
                output.stdout.trim()
            ))
        })
    }

    async fn call(&self, request: &CallRequest) -> Result<ForeignObject> {
        let payload = serde_json::to_vec(request)?;
        let output = self
            .runner
            .run(&self.invocation(BRIDGE_SCRIPT).stdin(payload))
            .await?;

        let response = parse_response(&output.stdout).ok_or_else(|| {
            error!(
                "[BRIDGE] No response from interpreter (exit {:?}): {}",
                output.code, output.stderr
            );
            HostError::InvocationError(format!(
                "interpreter exited with status {:?} without a response: {}",
                output.code,
                output.stderr.trim()
            ))
        })??;

        if !response.stdout.is_empty() {
            debug!("[BRIDGE] {} stdout: {}", request.target, response.stdout.trim_end());
        }
        if !response.stderr.is_empty() {
            debug!("[BRIDGE] {} stderr: {}", request.target, response.stderr.trim_end());
        }

        if response.ok {
            return Ok(response.result.unwrap_or_else(|| ForeignObject {
                none: true,
                ..ForeignObject::opaque("NoneType", "None")
            }));
        }
        if let Some(tb) = &response.traceback {
            debug!("[BRIDGE] {} traceback:\n{}", request.target, tb);
        }
        Err(HostError::InvocationError(format!(
            "{} failed during {}: {}",
            request.target,
            response.stage.as_deref().unwrap_or("call"),
            response.error.as_deref().unwrap_or("unknown error")
        )))
    }
}

/// Extract the JSON between the markers; `None` when the markers are absent
fn parse_response(stdout: &str) -> Option<Result<BridgeResponse>> {
    let start = stdout.rfind(MARKER_START)?;
    let end = stdout[start..].find(MARKER_END)? + start;
    let json = stdout[start + MARKER_START.len()..end].trim();
    Some(serde_json::from_str(json).map_err(HostError::from))
}
