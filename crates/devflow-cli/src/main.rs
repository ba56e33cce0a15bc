// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Reference CLI for the devflow workflow execution engine.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use devflow_core::config::{CliOverrides, EngineConfig};
use devflow_core::dag::Graph;
use devflow_core::result::{Observer, ProgressEvent, TracingObserver};
use devflow_core::{Engine, StepStatus, Workflow};
use devflow_dispatch::{BuiltinDispatcher, TokioShellRunner};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "devflow")]
#[command(version, about = "Dependency-graph workflow execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition.
    Validate {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow.
    Run {
        #[arg(value_name = "FILE")]
        file: String,

        /// Variable overrides, e.g. `--var env=prod`. May be repeated.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Overrides the document/config-file/env concurrency setting.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Renders every step and reports what would run without dispatching.
        #[arg(long)]
        dry_run: bool,

        /// Path to a devflow.yaml run-configuration file.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print a workflow's dependency layering without running it.
    Layers {
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Config is resolved before the tracing subscriber is installed so
    // `log_level` (file/env/CLI-layered) governs the default filter instead
    // of a hardcoded verbose/info split.
    let config_path = match &cli.command {
        Commands::Run { config, .. } => config.clone(),
        _ => None,
    };
    let max_concurrent = match &cli.command {
        Commands::Run { max_concurrent, .. } => *max_concurrent,
        _ => None,
    };
    let config = match EngineConfig::load(
        CliOverrides {
            max_concurrent,
            ..Default::default()
        },
        config_path.as_deref(),
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} failed to load run configuration: {e}", "Error:".red().bold());
            std::process::exit(1);
        }
    };

    init_tracing(cli.verbose, cli.json_logs, &config.log_level);

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run {
            file,
            vars,
            dry_run,
            ..
        } => run_workflow(&file, vars, dry_run, &config).await,
        Commands::Layers { file } => print_layers(&file),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool, json_logs: bool, configured_level: &str) {
    let level = if verbose { "debug" } else { configured_level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("devflow={level}").into());

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_workflow(file_path: &str) -> Result<Workflow> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read workflow file: {file_path}"))?;
    Workflow::load(&content).with_context(|| format!("workflow validation failed: {file_path}"))
}

fn validate_workflow(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);
    let workflow = load_workflow(file_path)?;
    info!(name = %workflow.name, steps = workflow.steps.len(), "workflow validated");
    println!("{}", "Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Entries: {}", workflow.steps.len());
    println!("{}", "Resolved execution order:".cyan().bold());
    print_execution_order(&workflow)?;
    Ok(())
}

fn print_layers(file_path: &str) -> Result<()> {
    let workflow = load_workflow(file_path)?;
    print_execution_order(&workflow)
}

fn print_execution_order(workflow: &Workflow) -> Result<()> {
    if !workflow.has_dependencies() {
        println!("{}", "No depends_on edges; entries run sequentially in declared order.".yellow());
        for entry in &workflow.steps {
            println!("  {}", entry.name().unwrap_or("<anonymous block>"));
        }
        return Ok(());
    }
    let steps: Vec<_> = workflow.top_level_steps().into_iter().cloned().collect();
    let graph = Graph::build(&steps).map_err(anyhow::Error::msg)?;
    for (i, layer) in graph.layers().iter().enumerate() {
        println!("{} {}", format!("Layer {i}:").cyan().bold(), layer.join(", "));
    }
    Ok(())
}

fn parse_vars(pairs: &[String]) -> Result<HashMap<String, Value>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--var must be KEY=VALUE, got '{pair}'"))?;
        vars.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(vars)
}

/// Prints progress as it happens and forwards the same events to `tracing`
/// (§4.11: "the log record and the progress event come from the same call
/// site").
struct CliObserver {
    tracing: TracingObserver,
}

impl Observer for CliObserver {
    fn on_event(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::StepStarted { name } => println!("  {} {name}", "→".dimmed()),
            ProgressEvent::StepCompleted { name, status, .. } => {
                println!("  {} {name}: {}", status_glyph(*status), format!("{status:?}").dimmed())
            }
            ProgressEvent::BlockStarted { name } => {
                println!("{} {}", "Parallel block:".cyan(), name.as_deref().unwrap_or("<anonymous>"))
            }
            _ => {}
        }
        self.tracing.on_event(event);
    }
}

fn status_glyph(status: StepStatus) -> colored::ColoredString {
    match status {
        StepStatus::Succeeded => "✓".green(),
        StepStatus::Failed | StepStatus::TimedOut => "✗".red(),
        StepStatus::Skipped => "○".yellow(),
        StepStatus::Cancelled => "⊘".yellow(),
    }
}

async fn run_workflow(
    file_path: &str,
    vars: Vec<String>,
    dry_run: bool,
    config: &EngineConfig,
) -> Result<()> {
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);
    let workflow = load_workflow(file_path)?;
    let caller_vars = parse_vars(&vars)?;

    let observer: Arc<dyn Observer> = Arc::new(CliObserver {
        tracing: TracingObserver,
    });
    let engine = Engine::new(Arc::new(BuiltinDispatcher::new()), Arc::new(TokioShellRunner::new()), observer);

    let result = engine
        .run(
            &workflow,
            config,
            caller_vars,
            dry_run,
            tokio_util::sync::CancellationToken::new(),
        )
        .await
        .with_context(|| "workflow execution failed")?;

    println!();
    if result.status == StepStatus::Succeeded {
        println!("{}", "Workflow completed successfully".green().bold());
    } else {
        println!("{}", "Workflow failed".red().bold());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&result).unwrap_or_else(|_| format!("{result:?}"))
    );

    if result.exit_code() != 0 {
        bail!("workflow finished with a failing status");
    }
    Ok(())
}
