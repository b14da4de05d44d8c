//! `blueprint` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: plan a blueprint JSON file and print its levels.
//! - `plan`: print the full execution plan as JSON.
//! - `dry-run`: execute a blueprint against echo tools and a canned model.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use engine::plan::{RECALL_TOOL, REMEMBER_TOOL};
use engine::{
    event_channel, Blueprint, EngineConfig, EngineContext, EngineEvent, ExecutionPlan, NodeKind,
    WorkflowExecutor,
};
use nodes::mock::{MockModel, MockSandbox, MockTool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blueprint", about = "Plan and run workflow blueprints", version)]
struct Cli {
    /// Engine configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "BLUEPRINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a blueprint and print its execution levels.
    Validate {
        /// Path to the blueprint JSON file.
        path: PathBuf,
    },
    /// Print the execution plan of a blueprint as JSON.
    Plan {
        path: PathBuf,
    },
    /// Run a blueprint with echo tools, a canned model and a permissive sandbox.
    DryRun {
        path: PathBuf,
        /// Run inputs as a JSON object, merged over the blueprint's own.
        #[arg(long)]
        inputs: Option<String>,
        /// Text every model call answers with.
        #[arg(long, default_value = "ok")]
        reply: String,
        /// Print lifecycle events to stderr as they happen.
        #[arg(long)]
        events: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("engine=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Validate { path } => {
            let blueprint = read_blueprint(&path)?;
            let plan = ExecutionPlan::build(&blueprint, &config)
                .with_context(|| format!("blueprint '{}' is invalid", blueprint.name))?;
            println!("blueprint '{}' is valid", plan.name());
            for (i, level) in plan.graph().levels().iter().enumerate() {
                println!("  level {i}: {}", level.join(", "));
            }
        }
        Command::Plan { path } => {
            let blueprint = read_blueprint(&path)?;
            let plan = ExecutionPlan::build(&blueprint, &config)?;
            println!("{}", serde_json::to_string_pretty(&plan.describe())?);
        }
        Command::DryRun {
            path,
            inputs,
            reply,
            events,
        } => {
            let blueprint = read_blueprint(&path)?;
            let inputs = match inputs {
                Some(raw) => serde_json::from_str(&raw).context("--inputs is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            dry_run(&blueprint, config, inputs, &reply, events).await?;
        }
    }
    Ok(())
}

fn read_blueprint(path: &Path) -> anyhow::Result<Blueprint> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(Blueprint::from_json(&raw)?)
}

async fn dry_run(
    blueprint: &Blueprint,
    config: EngineConfig,
    inputs: serde_json::Value,
    reply: &str,
    events: bool,
) -> anyhow::Result<()> {
    let plan = ExecutionPlan::build(blueprint, &config)?;
    let mut names = BTreeSet::new();
    collect_tools(&plan, &mut names);

    let mut builder = EngineContext::builder()
        .config(config)
        .model(Arc::new(MockModel::replying(reply, 0)))
        .sandbox(Arc::new(MockSandbox::new()));
    for name in &names {
        builder = builder.tool(Arc::new(MockTool::echo(name.clone())));
    }
    info!(tools = names.len(), "dry run with echo tools");

    let mut executor = WorkflowExecutor::new(builder.build());
    let observer = if events {
        let (tx, mut rx) = event_channel();
        executor = executor.with_events(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, EngineEvent::WorkflowFinished { .. }) {
                    continue;
                }
                match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => warn!(error = %e, "unprintable event"),
                }
            }
        }))
    } else {
        None
    };

    let result = executor.run_with_inputs(blueprint, inputs).await?;
    drop(executor);
    if let Some(handle) = observer {
        if let Err(e) = handle.await {
            warn!(error = %e, "event printer failed");
        }
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(failure) = &result.error {
        bail!("run {} failed: {}", result.run_id, failure.message);
    }
    Ok(())
}

/// Every registered-tool name the plan can reach, nested blueprints included.
fn collect_tools(plan: &ExecutionPlan, names: &mut BTreeSet<String>) {
    let agent_tools = |tools: &[String], names: &mut BTreeSet<String>| {
        for tool in tools {
            if tool != REMEMBER_TOOL && tool != RECALL_TOOL && plan.agent(tool).is_none() {
                names.insert(tool.clone());
            }
        }
    };
    for node in plan.nodes() {
        match &node.kind {
            NodeKind::Tool(spec) => {
                names.insert(spec.tool_name.clone());
            }
            NodeKind::Agent(agent) => agent_tools(&agent.tools, names),
            NodeKind::Recursive(spec) => {
                for participant in &spec.participants {
                    agent_tools(&participant.tools, names);
                }
            }
            _ => {}
        }
    }
    for nested in plan.nested_plans() {
        collect_tools(nested, names);
    }
}
