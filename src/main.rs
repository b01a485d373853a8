use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::{display_value, TrellisConfig};
use trellis_engine::{Context, NodeRegistry};
use trellis_sandbox::{extract_code, CodeSandbox};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Workflow orchestration with a restricted code sandbox")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file (JSON or TOML)
    Run {
        workflow: PathBuf,
        /// Seed a context entry; the value is parsed as JSON, falling back to a string
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, Value)>,
        /// Seed the context from a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Print the final context instead of the result
        #[arg(long)]
        show_context: bool,
    },
    /// Build a workflow without running it and print its tree
    Validate { workflow: PathBuf },
    /// Execute a snippet in the sandbox ("-" reads stdin)
    Sandbox {
        file: String,
        /// Allow an extra module on top of the configured ones
        #[arg(long = "allow", value_name = "MODULE")]
        allow: Vec<String>,
        /// Append tracebacks to error output
        #[arg(long)]
        traceback: bool,
        /// Run only the fenced code blocks found in the input
        #[arg(long)]
        extract: bool,
        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Completions don't need config or logging
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "trellis", &mut std::io::stdout());
        return Ok(());
    }

    let config = TrellisConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            workflow,
            set,
            context,
            show_context,
        } => {
            let seed = seed_context(context.as_deref(), set)?;
            run_workflow(config, &workflow, seed, show_context).await?;
        }
        Commands::Validate { workflow } => {
            let registry = NodeRegistry::new(config);
            let root = registry.load_workflow_file(&workflow)?;
            root.ensure_built()?;
            println!("{}", root.describe());
            info!(nodes = registry.len(), "workflow is valid");
        }
        Commands::Sandbox {
            file,
            allow,
            traceback,
            extract,
            json,
        } => {
            let source = read_source(&file)?;
            let code = if extract {
                let (_, blocks) = extract_code(&source);
                if blocks.is_empty() {
                    bail!("no code blocks found in {file}");
                }
                blocks.join("\n\n")
            } else {
                source
            };

            let mut sandbox_config = config.sandbox.clone();
            for module in allow {
                if !sandbox_config.allowed_modules.contains(&module) {
                    sandbox_config.allowed_modules.push(module);
                }
            }
            sandbox_config.add_traceback |= traceback;

            let sandbox = CodeSandbox::new(sandbox_config);
            let result = tokio::task::spawn_blocking(move || sandbox.execute(&code)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.format());
            }
            if result.has_errors() {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_workflow(
    config: TrellisConfig,
    workflow: &Path,
    seed: Map<String, Value>,
    show_context: bool,
) -> anyhow::Result<()> {
    let registry = NodeRegistry::new(config);
    let root = registry
        .load_workflow_file(workflow)
        .with_context(|| format!("loading workflow {}", workflow.display()))?;
    root.ensure_built()?;

    let ctx = Context::new();
    ctx.merge(seed);

    // Abort the whole tree on Ctrl-C
    let watcher = {
        let ctx = ctx.clone();
        let root = Arc::clone(&root);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            warn!("interrupted, stopping workflow");
            ctx.abort();
            root.abort();
        })
    };

    info!(workflow = %workflow.display(), root = %root.name(), "running workflow");
    let outcome = root.start(ctx).await;
    watcher.abort();
    let (ctx, result) = outcome?;

    if show_context {
        println!("{}", serde_json::to_string_pretty(&ctx.snapshot())?);
    } else {
        println!("{}", display_value(&result));
    }
    Ok(())
}

fn seed_context(json: Option<&str>, pairs: Vec<(String, Value)>) -> anyhow::Result<Map<String, Value>> {
    let mut seed = match json {
        Some(text) => match serde_json::from_str(text).context("parsing --context")? {
            Value::Object(map) => map,
            other => bail!("--context must be a JSON object, got {other}"),
        },
        None => Map::new(),
    };
    seed.extend(pairs);
    Ok(seed)
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err("empty key".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn read_source(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut source = String::new();
        std::io::stdin().read_to_string(&mut source)?;
        Ok(source)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {file}"))
    }
}
