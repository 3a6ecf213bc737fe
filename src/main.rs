use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

use conductor::config::Config;
use conductor::control::{self, ChannelNotifier, ControlHandler};
use conductor::core::dag::Complexity;
use conductor::orchestration::{
    plan_goal, Orchestrator, OrchestratorEvent, TaskGraphScheduler, TemplateDecomposer,
    WorkerRegistry,
};
use conductor::session::{CancelToken, ClientId, SessionController};
use conductor::worker::command::CommandWorker;
use conductor::Result;

/// Conductor - goal orchestration over pluggable workers
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve the JSON-lines control channel on stdin/stdout
    Serve {
        /// Client id used for the session
        #[arg(long, default_value = "local")]
        client: String,
    },

    /// Run a single goal and print the execution report as JSON
    Run {
        /// The goal in natural language
        goal: String,

        /// Override the assessed complexity (simple, medium, complex)
        #[arg(long)]
        complexity: Option<Complexity>,
    },

    /// Show how a goal would be decomposed and scheduled
    Plan {
        goal: String,

        #[arg(long)]
        complexity: Option<Complexity>,
    },

    /// List configured workers and whether their programs are available
    Workers,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    info!(debug = conductor::log::is_debug(), "conductor starting");

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Serve { client } => run_serve(config, ClientId::new(client)),
        Command::Run { goal, complexity } => run_goal(config, goal, complexity),
        Command::Plan { goal, complexity } => run_plan(config, goal, complexity),
        Command::Workers => run_workers(&config),
    }
}

/// Build a registry holding every configured command worker.
fn build_registry(config: &Config) -> Arc<WorkerRegistry> {
    let registry = WorkerRegistry::new(config.registry_config());
    for worker_config in &config.workers {
        let worker = CommandWorker::from_config(worker_config);
        if !worker.is_available() {
            warn!(worker = %worker_config.id, program = %worker.program(), "worker program not found on PATH");
        }
        registry.register(Arc::new(worker));
    }
    Arc::new(registry)
}

fn run_serve(config: Config, client: ClientId) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let registry = build_registry(&config);
        let decomposer = Arc::new(TemplateDecomposer::new(registry.clone(), config.plan.clone()));
        let notifier = Arc::new(ChannelNotifier::new());
        let outbound = notifier.attach();
        let handler = ControlHandler::new(
            registry.clone(),
            decomposer,
            Arc::new(SessionController::new(config.progress_replay)),
            notifier,
        );

        info!(client = %client, workers = registry.len(), "serving control channel on stdio");
        let result = control::serve(
            &handler,
            &client,
            BufReader::new(tokio::io::stdin()),
            outbound,
            tokio::io::stdout(),
        )
        .await;
        registry.shutdown().await;
        result
    })
}

fn run_goal(config: Config, goal: String, complexity: Option<Complexity>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let registry = build_registry(&config);
        let decomposer = TemplateDecomposer::new(registry.clone(), config.plan.clone());
        let mut graph = plan_goal(&decomposer, &goal, complexity).await?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OrchestratorEvent>();
        let progress = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                eprintln!("{}", event.describe());
            }
        });

        let orchestrator = Orchestrator::new(registry.clone()).with_events(event_tx);
        let report = orchestrator.execute(&mut graph, &CancelToken::new()).await;
        drop(orchestrator);
        let _ = progress.await;
        registry.shutdown().await;
        Ok::<_, conductor::Error>(report)
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_plan(config: Config, goal: String, complexity: Option<Complexity>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let registry = build_registry(&config);
        let decomposer = TemplateDecomposer::new(registry, config.plan.clone());
        let graph = plan_goal(&decomposer, &goal, complexity).await?;
        Ok::<_, conductor::Error>(TaskGraphScheduler::summarize(&graph))
    })?;

    println!("Goal:          {}", summary.goal);
    println!("Complexity:    {}", summary.complexity);
    println!("Mode:          {}", summary.mode);
    println!("Critical path: {:.0}s", summary.critical_path.as_secs_f64());
    println!();
    for (i, level) in summary.levels.iter().enumerate() {
        let ids: Vec<&str> = level.iter().map(|id| id.as_str()).collect();
        println!("  Level {}: {}", i, ids.join(", "));
    }
    Ok(())
}

fn run_workers(config: &Config) -> Result<()> {
    if config.workers.is_empty() {
        println!("No workers configured.");
        return Ok(());
    }

    let default = config.default_worker_id();
    for worker_config in &config.workers {
        let worker = CommandWorker::from_config(worker_config);
        let capabilities = worker_config.capabilities.normalize();
        let marker = if default.as_ref().is_some_and(|d| d.as_str() == worker_config.id) {
            " (default)"
        } else {
            ""
        };
        println!(
            "{}{}  command={}  capabilities=[{}]  {}",
            worker_config.id,
            marker,
            worker.program(),
            capabilities,
            if worker.is_available() { "available" } else { "missing" }
        );
    }
    Ok(())
}
