use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wfcore::{
    compile, ports, ConfigMap, ExecutionEvent, Graph, InMemoryStore, NewDefinition, Node, NodeEvent,
};
use wfnodes::{standard_registry, Collaborators};
use wfruntime::{
    GraphValidator, NodeTypeRegistry, PortDirection, RuntimeConfig, WorkflowRuntime,
};
use wfservice::{StartExecution, WorkflowDefinitionService, WorkflowExecutionService};

#[derive(Parser)]
#[command(name = "wf")]
#[command(about = "Workflow compiler and engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a graph file and print the execution plan
    Compile {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Validate a graph file
    Validate {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Execute a graph file against an in-memory store
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Run in test mode (mock outputs apply, concurrency limit bypassed)
        #[arg(long)]
        test: bool,

        /// JSON file of mock outputs keyed by node id
        #[arg(long)]
        mock: Option<PathBuf>,

        /// Execution timeout in seconds (0 disables it)
        #[arg(long)]
        timeout: Option<u64>,

        /// Runtime configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum nodes dispatched concurrently in a parallel group
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available node types
    Nodes,

    /// Create a new example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Compile { file } => compile_graph(&file)?,
        Commands::Validate { file } => validate_graph(&file)?,
        Commands::Run {
            file,
            input,
            test,
            mock,
            timeout,
            config,
            max_parallel,
            verbose: _,
        } => {
            let mut runtime_config = load_config(config.as_deref())?;
            if let Some(max) = max_parallel {
                runtime_config.max_parallel_nodes = max;
            }
            tracing::debug!("Runtime config: {:?}", runtime_config);
            let mocks = mock.as_deref().map(load_mocks).transpose()?;
            let input = match input {
                Some(raw) => serde_json::from_str(&raw).context("--input is not valid JSON")?,
                None => json!({}),
            };
            run_graph(&file, input, test, mocks, timeout, runtime_config).await?;
        }
        Commands::Nodes => list_nodes(),
        Commands::Init { output } => create_example_graph(&output)?,
    }

    Ok(())
}

fn load_graph(file: &Path) -> Result<Graph> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))
}

/// Defaults, overlaid by the config file when one is given.
fn load_config(file: Option<&Path>) -> Result<RuntimeConfig> {
    match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn load_mocks(file: &Path) -> Result<ConfigMap> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    match serde_json::from_str(&raw)? {
        Value::Object(map) => Ok(map),
        _ => bail!("mock file must hold a JSON object keyed by node id"),
    }
}

fn registry(config: &RuntimeConfig) -> Arc<NodeTypeRegistry> {
    Arc::new(standard_registry(&Collaborators::default(), config))
}

fn compile_graph(file: &Path) -> Result<()> {
    let graph = load_graph(file)?;
    let plan = compile(Uuid::nil(), 0, &graph, 0)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let graph = load_graph(file)?;
    let validator = GraphValidator::new(registry(&RuntimeConfig::default()));
    let issues = validator.validate(&graph);
    let compiled = compile(Uuid::nil(), 0, &graph, 0);

    if issues.is_empty() && compiled.is_ok() {
        println!("✅ Graph is valid:");
        println!("   Nodes: {}", graph.nodes.len());
        println!("   Connections: {}", graph.connections.len());
        return Ok(());
    }

    println!("❌ Graph is invalid:");
    for issue in &issues {
        println!("   • {}", issue);
    }
    if let Err(e) = compiled {
        println!("   • {}", e);
    }
    bail!("graph failed validation")
}

async fn run_graph(
    file: &Path,
    input: Value,
    test: bool,
    mocks: Option<ConfigMap>,
    timeout: Option<u64>,
    config: RuntimeConfig,
) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());
    let graph = load_graph(file)?;
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Connections: {}", graph.connections.len());
    println!();

    let store = InMemoryStore::new();
    let registry = registry(&config);
    let runtime = Arc::new(WorkflowRuntime::new(
        Arc::clone(&registry),
        Arc::new(store.clone()),
        config,
    ));
    let definitions = WorkflowDefinitionService::new(Arc::new(store.clone()), registry);
    let executions = WorkflowExecutionService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        runtime.clone(),
    );

    let tenant = Uuid::new_v4();
    let name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    let mut new = NewDefinition::new(name).with_graph(graph);
    if let Some(seconds) = timeout {
        new.timeout_seconds = seconds;
    }
    let draft = definitions.create(tenant, new).await?;
    let definition = definitions.publish(tenant, draft.id).await?;

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let mut params = StartExecution::new(input);
    if test {
        params = params.test(mocks);
    }
    let execution = executions.start(tenant, definition.id, params).await?;
    runtime.wait(execution.id).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let execution = executions.get(tenant, execution.id).await?;
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status);
    if let Some(error) = &execution.error {
        println!("   Error: {}", error);
    }

    println!();
    println!("🧾 Node executions:");
    for record in executions.node_executions(tenant, execution.id).await? {
        println!(
            "   {} ({}) {:?} attempt {}",
            record.node_id, record.node_type, record.status, record.attempt
        );
    }

    if let Some(output) = &execution.output {
        println!();
        println!("📤 Output:");
        println!("{}", serde_json::to_string_pretty(output)?);
    }

    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { .. } => {
            println!("▶️  Workflow started");
        }
        ExecutionEvent::NodeStarted { node_id, node_type, attempt, .. } => {
            if attempt > 1 {
                println!("  🔁 Retrying node: {} ({}) attempt {}", node_id, node_type, attempt);
            } else {
                println!("  ⚡ Starting node: {} ({})", node_id, node_type);
            }
        }
        ExecutionEvent::NodeCompleted { node_id, port, duration_ms, .. } => {
            println!("  ✅ Node {} completed in {}ms via '{}'", node_id, duration_ms, port);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped { node_id, .. } => {
            println!("  ⏭️  Node {} skipped", node_id);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {:.0}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {:.0}%", node_id, percent);
                }
            }
        },
        ExecutionEvent::WorkflowCompleted { status, duration_ms, .. } => {
            println!("🏁 Workflow {} after {}ms", status, duration_ms);
        }
    }
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry(&RuntimeConfig::default());
    for node_type in registry.list_node_types() {
        let Some(definition) = registry.get(&node_type) else {
            continue;
        };
        let outs: Vec<&str> = definition
            .ports
            .iter()
            .filter(|p| p.direction == PortDirection::Out)
            .map(|p| p.name.as_str())
            .collect();
        println!("  • {} ({:?})", node_type, definition.category);
        println!("    {}", definition.label);
        if !outs.is_empty() {
            println!("    out: {}", outs.join(", "));
        }
    }
}

fn create_example_graph(output: &Path) -> Result<()> {
    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(
        Node::new("check", "condition")
            .with_config("field", "input.hosts")
            .with_config("operator", "truthy"),
    );
    graph.add_node(Node::new("each", "forEach").with_config("items", "input.hosts"));
    graph.add_node(
        Node::new("provision", "activity")
            .with_config("activity_id", "provision-vm")
            .with_config("input", json!({"host": "{{nodes.each.item}}"}))
            .with_retry(3, 500),
    );
    graph.add_node(Node::new("end", "end"));

    graph.connect("start", "check");
    graph.connect_port("check", ports::TRUE, "each");
    graph.connect_port("check", ports::FALSE, "end");
    graph.connect_port("each", ports::BODY, "provision");
    graph.connect("provision", "each");
    graph.connect_port("each", ports::DONE, "end");

    let json = serde_json::to_string_pretty(&graph)?;
    std::fs::write(output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  wf run --file {} --input '{{\"hosts\": [\"web-01\", \"web-02\"]}}'",
        output.display()
    );

    Ok(())
}
