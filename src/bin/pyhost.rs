use anyhow::{anyhow, bail, Context};
use pyhost::{
    bridge, EnvironmentResolver, EnvironmentSpec, HostConfig, HostError, NativeValue,
    PackageSet, PythonVersion, RuntimeHandle,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

const USAGE: &str = "usage: pyhost [--config FILE] <command>

commands:
  resolve <name> --python X.Y [--package NAME==VER]... [--requirements FILE] [--code-dir DIR] [--force]
  inspect <name> --python X.Y [--package NAME==VER]... [--requirements FILE]
  remove  <name>
  list
  invoke  <name> <module.function> [--arg JSON] [--kwargs JSON] [--code-dir DIR]";

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    positional: Vec<String>,
    python: Option<String>,
    packages: Vec<String>,
    requirements: Option<PathBuf>,
    code_dir: Option<PathBuf>,
    force: bool,
    arg: Option<String>,
    kwargs: Option<String>,
}

impl CliArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut parsed = CliArgs::default();
        let mut i = 0;
        while i < args.len() {
            let value = || {
                args.get(i + 1)
                    .cloned()
                    .ok_or_else(|| anyhow!("{} needs a value", args[i]))
            };
            match args[i].as_str() {
                "--config" => {
                    parsed.config = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--python" => {
                    parsed.python = Some(value()?);
                    i += 2;
                }
                "--package" => {
                    parsed.packages.push(value()?);
                    i += 2;
                }
                "--requirements" => {
                    parsed.requirements = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--code-dir" => {
                    parsed.code_dir = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--arg" => {
                    parsed.arg = Some(value()?);
                    i += 2;
                }
                "--kwargs" => {
                    parsed.kwargs = Some(value()?);
                    i += 2;
                }
                "--force" => {
                    parsed.force = true;
                    i += 1;
                }
                flag if flag.starts_with("--") => bail!("unknown option {}\n\n{}", flag, USAGE),
                other => {
                    parsed.positional.push(other.to_string());
                    i += 1;
                }
            }
        }
        Ok(parsed)
    }

    fn name(&self) -> anyhow::Result<&str> {
        self.positional
            .get(1)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing environment name\n\n{}", USAGE))
    }

    fn spec(&self) -> anyhow::Result<EnvironmentSpec> {
        let version: PythonVersion = self
            .python
            .as_deref()
            .ok_or_else(|| anyhow!("--python is required"))?
            .parse()?;

        let mut references = self.packages.clone();
        if let Some(path) = &self.requirements {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            references.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
        let packages = PackageSet::parse(&references)?;
        Ok(EnvironmentSpec::with_packages(
            self.name()?,
            version,
            packages,
            self.code_dir.clone(),
        )?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pyhost=info".to_string()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = CliArgs::parse(&raw)?;
    if args.positional.is_empty() {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }

    match run(&args).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            let host_error = e.downcast_ref::<HostError>();
            let fatal = host_error.map(HostError::is_fatal).unwrap_or(false);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "error": format!("{:#}", e), "fatal": fatal }))?
            );
            // Malformed requests exit 2, like usage errors
            let code = if host_error.is_some_and(HostError::is_request_error) { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}

async fn run(args: &CliArgs) -> anyhow::Result<Value> {
    let config = HostConfig::load(args.config.as_deref())?;
    let resolver = EnvironmentResolver::new(config)?;

    match args.positional[0].as_str() {
        "resolve" => {
            let resolution = resolver.resolve(&args.spec()?, args.force).await?;
            Ok(serde_json::to_value(resolution)?)
        }
        "inspect" => Ok(serde_json::to_value(resolver.inspect(&args.spec()?)?)?),
        "remove" => {
            let name = args.name()?;
            let removed = resolver.remove_environment(name).await?;
            Ok(json!({ "name": name, "removed": removed }))
        }
        "list" => Ok(serde_json::to_value(resolver.list_environments()?)?),
        "invoke" => invoke(&resolver, args).await,
        other => bail!("unknown command {}\n\n{}", other, USAGE),
    }
}

async fn invoke(resolver: &EnvironmentResolver, args: &CliArgs) -> anyhow::Result<Value> {
    let name = args.name()?;
    let target = args
        .positional
        .get(2)
        .ok_or_else(|| anyhow!("missing function name\n\n{}", USAGE))?;
    let environment = resolver
        .probe(name)?
        .ok_or_else(|| anyhow!("environment '{}' does not exist", name))?;

    let positional = match &args.arg {
        Some(text) => vec![NativeValue::from_json(
            serde_json::from_str(text).context("--arg is not valid JSON")?,
        )],
        None => Vec::new(),
    };
    let keywords: BTreeMap<String, NativeValue> = match &args.kwargs {
        Some(text) => {
            let parsed: serde_json::Map<String, Value> =
                serde_json::from_str(text).context("--kwargs must be a JSON object")?;
            parsed
                .into_iter()
                .map(|(k, v)| (k, NativeValue::from_json(v)))
                .collect()
        }
        None => BTreeMap::new(),
    };

    // Without --code-dir, use the directory the environment was created with
    let code_dir = match &args.code_dir {
        Some(dir) => Some(dir.clone()),
        None => resolver.code_directory(&environment)?,
    };
    let mut runtime = RuntimeHandle::for_environment(
        &environment,
        code_dir.as_deref(),
        resolver.runner(),
        resolver.config(),
    );
    runtime.initialize().await?;
    let result = bridge::invoke(&runtime, target, positional, keywords).await?;
    let value = bridge::to_native(&result)?;
    Ok(json!({ "type": result.type_name, "value": value.to_json() }))
}
