use crate::errors::{HostError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// A single external program run, as an argv list (no shell involved)
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin, which is closed afterwards
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ProcessInvocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Short program name for error messages
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Whether any argument equals `needle`
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Human-readable command line, for logs only
    pub fn display(&self) -> String {
        let mut parts = vec![quote_path(&self.program.to_string_lossy())];
        parts.extend(self.args.iter().map(|a| quote_path(&a.to_string_lossy())));
        parts.join(" ")
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Turn a non-zero exit into `SubprocessFailure` carrying stderr verbatim
    pub fn into_success(self, program: &str) -> Result<ProcessOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(HostError::SubprocessFailure {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr,
            })
        }
    }
}

/// Spawns external programs and waits for them
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ProcessOutput>;
}

/// Runs invocations with tokio, one at a time per call
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ProcessOutput> {
        debug!("[PROCESS] Running {}", invocation.display());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HostError::SubprocessFailure {
                    program: invocation.program_name(),
                    code: None,
                    stderr: format!("executable not found: {}", invocation.program.display()),
                }
            } else {
                HostError::Io(e)
            }
        })?;

        // Feed stdin from its own task so a chatty child cannot block us
        if let (Some(input), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("[PROCESS] stdin closed early: {}", e);
                }
            });
        }

        // wait_with_output drains stdout and stderr before reaping the child
        match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                code: output.status.code(),
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(HostError::Io(e)),
            Err(_) => {
                // Dropping the wait future kills the child (kill_on_drop)
                warn!(
                    "[PROCESS] {} timed out after {:?}",
                    invocation.program_name(),
                    invocation.timeout
                );
                Err(HostError::Timeout {
                    program: invocation.program_name(),
                    minutes: invocation.timeout.as_secs().div_ceil(60),
                })
            }
        }
    }
}

/// Wrap a path containing a space in double quotes unless it already is quoted
pub fn quote_path(path: &str) -> String {
    let already_quoted = path.len() >= 2 && path.starts_with('"') && path.ends_with('"');
    if path.contains(' ') && !already_quoted {
        format!("\"{}\"", path)
    } else {
        path.to_string()
    }
}

/// Locate a system interpreter on PATH, preferring the versioned name
pub fn find_system_python(preferred: Option<&str>) -> Result<PathBuf> {
    if let Some(name) = preferred {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| HostError::PythonNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_path() {
        assert_eq!(quote_path("/usr/bin/python"), "/usr/bin/python");
        assert_eq!(
            quote_path("C:\\Program Files\\Python\\python.exe"),
            "\"C:\\Program Files\\Python\\python.exe\""
        );
        assert_eq!(quote_path("\"/my envs/python\""), "\"/my envs/python\"");
        assert_eq!(quote_path(""), "");
    }

    #[test]
    fn test_invocation_display_quotes_spaces() {
        let invocation = ProcessInvocation::new("/opt/my python/bin/python", Duration::from_secs(1))
            .args(["-m", "pip", "install"])
            .arg("/tmp/req file.txt");
        assert_eq!(
            invocation.display(),
            "\"/opt/my python/bin/python\" -m pip install \"/tmp/req file.txt\""
        );
        assert!(invocation.has_arg("pip"));
        assert_eq!(invocation.program_name(), "python");
    }

    #[test]
    fn test_failure_keeps_stderr() {
        let output = ProcessOutput {
            code: Some(1),
            success: false,
            stdout: String::new(),
            stderr: "ERROR: No matching distribution".to_string(),
        };
        match output.into_success("pip") {
            Err(HostError::SubprocessFailure { program, code, stderr }) => {
                assert_eq!(program, "pip");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "ERROR: No matching distribution");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_captures_output_and_stdin() {
        let runner = TokioProcessRunner::new();
        let invocation = ProcessInvocation::new("sh", Duration::from_secs(10))
            .args(["-c", "cat; echo oops >&2; exit 3"])
            .stdin("hello");
        let output = runner.run(&invocation).await.unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.code, Some(3));
        assert!(!output.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_times_out() {
        let runner = TokioProcessRunner::new();
        let invocation =
            ProcessInvocation::new("sleep", Duration::from_millis(100)).arg("5");
        let result = runner.run(&invocation).await;
        assert!(matches!(result, Err(HostError::Timeout { .. })));
    }

    #[test]
    fn test_missing_program_is_subprocess_failure() {
        let runner = TokioProcessRunner::new();
        let invocation =
            ProcessInvocation::new("/definitely/not/here/python", Duration::from_secs(1));
        let result = tokio_test::block_on(runner.run(&invocation));
        assert!(matches!(result, Err(HostError::SubprocessFailure { .. })));
    }
}
