mod dispatch;
mod steps;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plexus_core::ambiance::ExecutionMetadata;
use plexus_core::config::AppConfig;
use plexus_core::event::OrchestrationEvent;
use plexus_core::plan::Plan;
use plexus_core::types::{ExecutionMode, Status};
use plexus_engine::EngineBuilder;

use dispatch::LoopbackDispatcher;

#[derive(Parser)]
#[command(name = "plexus", version, about = "Resumable pipeline orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "PLEXUS_CONFIG", default_value = "plexus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file with the built-in demo steps
    Run {
        /// Plan in JSON form
        plan: PathBuf,
        /// Setup abstraction (KEY=VALUE), e.g. accountId=acme
        #[arg(long = "setup", value_name = "KEY=VALUE")]
        setup: Vec<String>,
        /// Print the execution graph as JSON when the plan finishes
        #[arg(long)]
        graph: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
    /// Check a plan file without running it
    Validate {
        /// Plan in JSON form
        plan: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "plexus", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_filter().unwrap_or("plexus=info,warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { plan } => {
            let plan = load_plan(&plan)?;
            let problems = plan_problems(&plan, &known_step_types());
            if problems.is_empty() {
                println!("Plan {} is valid ({} nodes)", plan.uuid, plan.nodes.len());
            } else {
                for problem in &problems {
                    eprintln!("  - {problem}");
                }
                anyhow::bail!("plan {} has {} problem(s)", plan.uuid, problems.len());
            }
        }
        Commands::Run {
            plan,
            setup,
            graph,
            timeout_secs,
        } => {
            let plan = load_plan(&plan)?;
            let setup = parse_setup(&setup)?;
            let status = run_plan(config, plan, setup, graph, Duration::from_secs(timeout_secs)).await?;
            if status != Status::Succeeded {
                anyhow::bail!("plan execution finished as {status:?}");
            }
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn run_plan(
    config: AppConfig,
    plan: Plan,
    setup: BTreeMap<String, String>,
    print_graph: bool,
    timeout: Duration,
) -> anyhow::Result<Status> {
    let (dispatcher, submissions) = LoopbackDispatcher::new();
    let mut builder = EngineBuilder::new()
        .with_config(config)
        .with_dispatcher(std::sync::Arc::new(dispatcher));
    for step in steps::builtin_steps() {
        builder = builder.with_step(step);
    }
    let engine = builder.build()?;

    let cancel = CancellationToken::new();
    let worker = engine.spawn(cancel.clone())?;
    tokio::spawn(dispatch::run_loopback(
        engine.clone(),
        submissions,
        cancel.clone(),
    ));

    // Spawn event printer
    let mut rx = engine.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                OrchestrationEvent::NodeStatusChanged {
                    node_execution_id,
                    to,
                    ..
                } => {
                    eprintln!("[{}] {:?}", short(&node_execution_id), to);
                }
                OrchestrationEvent::NodeRetried { old_id, new_id, .. } => {
                    eprintln!("[{}] retried as {}", short(&old_id), short(&new_id));
                }
                OrchestrationEvent::PlanCompleted { status, .. } => {
                    eprintln!("plan finished: {status:?}");
                    break;
                }
                _ => {}
            }
        }
    });

    let metadata = ExecutionMetadata {
        pipeline_identifier: plan.uuid.clone(),
        ..ExecutionMetadata::default()
    };
    let plan_execution_id = engine.start_plan(plan, setup, metadata).await?;
    info!(plan_execution_id = %plan_execution_id, "Plan execution started");

    let status = match tokio::time::timeout(timeout, engine.await_completion(&plan_execution_id)).await {
        Ok(status) => status?,
        Err(_) => {
            warn!(plan_execution_id = %plan_execution_id, "Timed out, aborting");
            engine.abort_plan(&plan_execution_id).await?;
            tokio::time::timeout(Duration::from_secs(5), engine.await_completion(&plan_execution_id))
                .await
                .context("plan did not stop after abort")??
        }
    };
    printer.await.ok();

    if print_graph {
        if let Some(graph) = engine.graph(&plan_execution_id) {
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
    }

    cancel.cancel();
    worker.await.ok();
    Ok(status)
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    Ok(Plan::from_json(&content)?)
}

fn known_step_types() -> Vec<String> {
    steps::builtin_steps()
        .iter()
        .map(|s| s.step_type().to_string())
        .collect()
}

/// Problems the engine would only hit mid-run: unknown step types and
/// references to plan nodes that do not exist.
fn plan_problems(plan: &Plan, step_types: &[String]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut ids: Vec<&String> = plan.nodes.keys().collect();
    ids.sort();

    for id in ids {
        let node = &plan.nodes[id];
        let step_type = &node.step_type.type_name;
        if !step_types.contains(step_type) {
            problems.push(format!("node '{id}': unknown step type '{step_type}'"));
        }

        let mut references: Vec<String> = node
            .advisers
            .iter()
            .filter_map(|a| a.parameters.get("next_node_id"))
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let params = &node.step_parameters;
        match step_type.as_str() {
            "fork" => references.extend(string_list(params.get("children"))),
            "section" => references.extend(params.get("child").and_then(|v| v.as_str()).map(str::to_string)),
            "chain" if node.mode == ExecutionMode::ChildChain => {
                references.extend(string_list(params.get("links")))
            }
            _ => {}
        }
        for reference in references {
            if !plan.nodes.contains_key(&reference) {
                problems.push(format!("node '{id}': refers to missing node '{reference}'"));
            }
        }
    }
    problems
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_setup(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("setup value '{pair}' is not KEY=VALUE"))
        })
        .collect()
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
