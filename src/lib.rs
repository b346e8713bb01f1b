//! Named, reproducible Python environments and a value bridge for calling
//! into them.
//!
//! An [`EnvironmentSpec`] names an environment, its interpreter version and
//! an exact set of pinned packages. [`EnvironmentResolver::resolve`] makes
//! the disk agree with it: reusing a matching environment without spawning
//! anything, creating a missing one, and refusing (or, when forced,
//! rebuilding) a mismatching one.
//!
//! ```no_run
//! use pyhost::{bridge, EnvironmentResolver, EnvironmentSpec, HostConfig, PythonVersion, RuntimeHandle};
//! use std::collections::BTreeMap;
//!
//! # async fn demo() -> pyhost::Result<()> {
//! let resolver = EnvironmentResolver::new(HostConfig::load(None)?)?;
//! let spec = EnvironmentSpec::new("analysis", PythonVersion::V3_11, ["numpy==1.26.4"], None)?;
//! let env = resolver.resolve(&spec, false).await?.into_environment();
//!
//! let mut runtime = RuntimeHandle::for_environment(&env, None, resolver.runner(), resolver.config());
//! runtime.initialize().await?;
//! let mean = bridge::invoke(&runtime, "statistics.mean", vec![vec![1, 2, 3].into()], BTreeMap::new()).await?;
//! let mean: f64 = bridge::to_native_typed(&mean)?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod environment;
mod errors;
pub mod fs;
pub mod installer;
pub mod kernel;
pub mod package;
pub mod process;
pub mod resolver;
pub mod runtime;
pub mod value;

#[cfg(test)]
mod testing;

pub use bridge::{invoke, to_foreign, to_native, to_native_typed, CallRequest, CallShape, FromNative};
pub use config::{HostConfig, PythonVersion};
pub use environment::{EnvironmentLayout, EnvironmentSpec, ExistingEnvironment};
pub use errors::{HostError, Result};
pub use package::{packages_match, PackageSet, PackageSpec};
pub use process::{ProcessRunner, TokioProcessRunner};
pub use resolver::{EnvironmentResolver, EnvironmentState, Resolution};
pub use runtime::{Interpreter, PythonInterpreter, RuntimeHandle, RuntimeInfo, RuntimeState};
pub use value::{ForeignKind, ForeignObject, ForeignValue, NativeValue};
