use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Invalid environment name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Package '{0}' is not pinned to an exact version (expected name==version)")]
    UnpinnedPackage(String),

    #[error("Invalid package reference: {0}")]
    InvalidPackage(String),

    #[error("Package '{0}' is requested more than once with different versions")]
    DuplicatePackage(String),

    #[error("Environment '{name}' has Python {installed}, but {requested} was requested")]
    VersionConflict {
        name: String,
        installed: String,
        requested: String,
    },

    #[error("Environment '{environment}' is missing requested package {package}")]
    PackageConflict {
        environment: String,
        package: String,
    },

    #[error("{program} exited with status {code:?}: {stderr}")]
    SubprocessFailure {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} did not finish within {minutes} minute(s)")]
    Timeout { program: String, minutes: u64 },

    #[error("Cannot convert native value of type '{0}' to a foreign value")]
    UnsupportedConversion(String),

    #[error("Unrecognized foreign type: {0}")]
    UnrecognizedForeignType(String),

    #[error("Expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Invocation failed: {0}")]
    InvocationError(String),

    #[error("Failed to remove {path:?}: {message}")]
    RemovalFailure { path: PathBuf, message: String },

    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Python runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Unknown Python version: {0}")]
    UnknownPythonVersion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostError {
    /// Embedding failures cannot be recovered without a fresh runtime handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::RuntimeUnavailable(_))
    }

    /// Errors raised before any I/O takes place.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            HostError::InvalidName { .. }
                | HostError::UnpinnedPackage(_)
                | HostError::InvalidPackage(_)
                | HostError::DuplicatePackage(_)
                | HostError::UnknownPythonVersion(_)
        )
    }
}
