use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use troupe_agent::{DependencyGraph, NodeId, StaticAction};
use troupe_core::config::AppConfig;
use troupe_core::error::TroupeError;
use troupe_core::event::EventBus;
use troupe_core::types::{ActionStatus, AgentEvent};

#[derive(Parser)]
#[command(name = "troupe", version, about = "Agent lifecycle and dependency-graph orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "troupe.toml", env = "TROUPE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config,
    /// Check a step file for cycles and print its execution order
    Plan {
        /// TOML file with [[steps]] entries
        file: PathBuf,
        /// Run the steps after ordering them
        #[arg(long)]
        execute: bool,
        /// Print the graph in Graphviz DOT format
        #[arg(long)]
        dot: bool,
    },
}

/// A step file:
///
/// ```toml
/// [[steps]]
/// name = "design"
/// content = "schema.sql"
///
/// [[steps]]
/// name = "implement"
/// after = ["design"]
/// ```
#[derive(Debug, Deserialize)]
struct StepFile {
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    name: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    after: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("troupe=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { file, execute, dot } => {
            run_plan(&config, &file, execute, dot).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => Ok(config),
        Err(TroupeError::ConfigNotFound(_)) => {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

fn build_graph(spec: &StepFile, event_bus: Arc<EventBus>) -> anyhow::Result<DependencyGraph> {
    let mut graph = DependencyGraph::new().with_event_bus(event_bus);
    let mut ids: HashMap<&str, NodeId> = HashMap::new();

    for step in &spec.steps {
        let content = step
            .content
            .clone()
            .unwrap_or_else(|| format!("{} done", step.name));
        let id = graph.add_node(Arc::new(StaticAction::new(step.name.clone(), content)));
        if ids.insert(step.name.as_str(), id).is_some() {
            bail!("step '{}' is defined more than once", step.name);
        }
    }

    for step in &spec.steps {
        let to = &ids[step.name.as_str()];
        for dep in &step.after {
            let Some(from) = ids.get(dep.as_str()) else {
                bail!("step '{}' runs after unknown step '{}'", step.name, dep);
            };
            graph.add_edge(from, to)?;
        }
    }
    Ok(graph)
}

async fn run_plan(config: &AppConfig, file: &Path, execute: bool, dot: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let spec: StepFile =
        toml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let event_bus = Arc::new(EventBus::new(config.events.capacity));
    let mut graph = build_graph(&spec, event_bus.clone())?;
    info!(steps = graph.len(), "Step file loaded");

    if dot {
        print!("{}", graph.to_dot());
    }

    if let Some(cycle) = graph.find_cycle() {
        let names: Vec<String> = cycle
            .iter()
            .filter_map(|id| graph.node(id).map(|n| n.name().to_string()))
            .collect();
        bail!("cycle detected: {}", names.join(" -> "));
    }

    println!("Execution order:");
    for (i, id) in graph.execution_order().iter().enumerate() {
        if let Some(node) = graph.node(id) {
            println!("  {}. {}", i + 1, node.name());
        }
    }

    if !execute {
        return Ok(());
    }

    let printer = tokio::spawn(print_node_status(event_bus.subscribe()));

    println!("Executing:");
    let output = graph.execute(None).await?;
    drop(graph);
    drop(event_bus);
    match printer.await {
        Ok(printed) => debug!(printed, "Status printer finished"),
        Err(e) => warn!(error = %e, "Event printer stopped unexpectedly"),
    }

    println!("Result: {}", output.content);
    if output.status == ActionStatus::Failed {
        bail!("execution aborted: {}", output.content);
    }
    Ok(())
}

/// Print node status changes until the bus closes. Returns how many were
/// printed. Events lost to a slow reader are skipped, not fatal.
async fn print_node_status(mut rx: broadcast::Receiver<AgentEvent>) -> usize {
    let mut printed = 0;
    loop {
        match rx.recv().await {
            Ok(AgentEvent::NodeStatusChanged { name, status, .. }) => {
                println!("  [{status}] {name}");
                printed += 1;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Status printer fell behind, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    printed
}
