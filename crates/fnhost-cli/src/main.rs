#![warn(missing_docs)]

//! fnhost: run registered functions in an isolated V8 sandbox.
//!
//! Functions come from a JSON catalogue of registration requests. Results
//! are printed to stdout as the HTTP-shaped response; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fnhost_config::FnhostConfig;
use fnhost_engine::{ExecutionEngine, ExecutionRequest};
use fnhost_registry::{FunctionRegistry, InMemoryRegistry};
use fnhost_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, NoopAuditLogger, TracingAuditLogger};
use fnhost_sandbox::{DynamicValue, KvStore, SandboxExecutor};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fnhost", version)]
#[command(about = "Execute registered functions in an isolated sandbox", long_about = None)]
struct Cli {
    /// Config file (overrides FNHOST_CONFIG and ./fnhost.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a function and print the response.
    Exec {
        /// JSON catalogue of function registrations.
        #[arg(long)]
        functions: PathBuf,
        /// Function id or name.
        id_or_name: String,
        /// Arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        args: String,
    },
    /// List the functions of a project.
    List {
        /// JSON catalogue of function registrations.
        #[arg(long)]
        functions: PathBuf,
        /// Project id.
        #[arg(long)]
        project: String,
    },
    /// Validate every definition in a catalogue.
    Check {
        /// JSON catalogue of function registrations.
        #[arg(long)]
        functions: PathBuf,
    },
}

fn load_config(explicit: Option<&Path>) -> Result<FnhostConfig> {
    match explicit {
        Some(path) => FnhostConfig::load_from(Some(path), Path::new("."))
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => FnhostConfig::load().context("failed to load config"),
    }
}

async fn load_catalogue(path: &Path, config: &FnhostConfig) -> Result<InMemoryRegistry> {
    let max_code_size = config.sandbox_config()?.max_code_size;
    InMemoryRegistry::load_from_file(path, max_code_size)
        .await
        .with_context(|| format!("failed to load functions from {}", path.display()))
}

async fn build_audit_logger(config: &FnhostConfig) -> Result<Arc<dyn AuditLogger>> {
    if !config.audit.enabled {
        return Ok(Arc::new(NoopAuditLogger));
    }
    match &config.audit.path {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            tracing::info!(path = %path.display(), "audit log enabled");
            Ok(Arc::new(JsonLinesAuditLogger::new(file)))
        }
        None => Ok(Arc::new(TracingAuditLogger)),
    }
}

fn parse_args(json: &str) -> Result<Vec<DynamicValue>> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("--args must be valid JSON")?;
    match value {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(DynamicValue::from).collect()),
        other => anyhow::bail!("--args must be a JSON array, got {other}"),
    }
}

async fn exec(
    config: &FnhostConfig,
    functions: &Path,
    id_or_name: &str,
    args: &str,
) -> Result<ExitCode> {
    let args = parse_args(args)?;
    let registry = Arc::new(load_catalogue(functions, config).await?);

    let mut engine = ExecutionEngine::new(registry, SandboxExecutor::new(config.sandbox_config()?))
        .with_audit_logger(build_audit_logger(config).await?);
    if let Some(kv) = config.kv_config()? {
        engine = engine.with_kv(Arc::new(KvStore::new(kv)));
    }

    let result = engine.execute(id_or_name, ExecutionRequest::new(args)).await;
    let response = serde_json::to_string_pretty(&result.to_response())?;
    println!("{response}");

    if result.is_success() {
        return Ok(ExitCode::SUCCESS);
    }
    if let Err(e) = result.into_result() {
        let structured = engine.structured_error(id_or_name, &e).await;
        if let Some(fix) = structured.get("suggested_fix").and_then(|v| v.as_str()) {
            eprintln!("{fix}");
        }
    }
    Ok(ExitCode::FAILURE)
}

async fn list(config: &FnhostConfig, functions: &Path, project: &str) -> Result<ExitCode> {
    let registry = load_catalogue(functions, config).await?;
    let definitions = registry.list_definitions(project).await?;
    let rows: Vec<serde_json::Value> = definitions
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
                "language": d.language,
                "callable": d.callable(),
                "statementBody": d.source.is_statement_body(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(ExitCode::SUCCESS)
}

async fn check(config: &FnhostConfig, functions: &Path) -> Result<ExitCode> {
    let registry = load_catalogue(functions, config).await?;
    let mut unsupported = 0;
    for name in registry.names().await {
        let definition = registry.get_definition(&name).await?;
        if !definition.language.is_embedded() {
            tracing::warn!(
                function = %definition.name,
                language = %definition.language,
                "function will be rejected at execution: unsupported language"
            );
            unsupported += 1;
        }
    }
    let total = registry.len().await;
    println!("{total} function(s) valid, {unsupported} with an unsupported language");
    Ok(if unsupported == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Exec {
            functions,
            id_or_name,
            args,
        } => exec(&config, &functions, &id_or_name, &args).await,
        Command::List { functions, project } => list(&config, &functions, &project).await,
        Command::Check { functions } => check(&config, &functions).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "fnhost",
            "exec",
            "--functions",
            "fns.json",
            "add",
            "--args",
            "[2, 3]",
        ])
        .unwrap();
        match cli.command {
            Command::Exec {
                functions,
                id_or_name,
                args,
            } => {
                assert_eq!(functions, PathBuf::from("fns.json"));
                assert_eq!(id_or_name, "add");
                assert_eq!(args, "[2, 3]");
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn cli_list_requires_project() {
        assert!(Cli::try_parse_from(["fnhost", "list", "--functions", "fns.json"]).is_err());
    }

    #[test]
    fn args_must_be_an_array() {
        assert_eq!(parse_args("[1, \"a\"]").unwrap().len(), 2);
        assert!(parse_args("{\"a\": 1}").is_err());
        assert!(parse_args("not json").is_err());
    }

    #[tokio::test]
    async fn exec_runs_catalogue_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("functions.json");
        std::fs::write(
            &path,
            r#"[{"projectId": "p", "name": "add", "code": "function add(a, b) { return a + b; }"}]"#,
        )
        .unwrap();

        let config = FnhostConfig::default();
        let code = exec(&config, &path, "add", "[2, 3]").await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        let code = exec(&config, &path, "missing", "[]").await.unwrap();
        assert_eq!(code, ExitCode::FAILURE);
    }
}
