use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use meshengine::orchestration::{JsonSummaryComposer, StaticPlanner};
use meshengine::state::{CheckpointStore, FileCheckpointStore};
use meshengine::tools::builtin_registry;
use meshengine::workflow::{ExecutionState, RunId};
use meshengine::{Engine, EngineConfig, Error, Result};

/// meshengine - plan, schedule and validate tool-calling task graphs
#[derive(Parser, Debug)]
#[command(name = "meshengine")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    \
    MESHENGINE_DEBUG=1       Enable debug logging (alternative to --debug)\n    \
    MESHENGINE_LOG=<filter>  Override the log filter\n    \
    MESHENGINE_CONFIG=<path> Use an alternative config file")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.meshengine/engine.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.meshengine/engine.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a JSON plan until every task succeeds or the budget runs out
    Run {
        /// JSON array of task specs
        plan: PathBuf,

        /// Goal recorded with the run (defaults to the plan file name)
        #[arg(long)]
        goal: Option<String>,
    },

    /// Continue a run from its latest checkpoint, including runs stopped with Ctrl-C
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Plan to use for any further planning cycles
        plan: PathBuf,
    },

    /// Show the latest checkpoint of a run
    Inspect {
        /// Run ID to inspect
        run_id: String,
    },

    /// List runs with checkpoints
    Runs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    meshengine::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    tracing::debug!(command = ?cli.command, "meshengine starting");

    match cli.command {
        Command::Run { plan, goal } => {
            let goal = goal.unwrap_or_else(|| plan.display().to_string());
            run_plan(config, &plan, goal)
        }
        Command::Resume { run_id, plan } => resume_run(config, &run_id, &plan),
        Command::Inspect { run_id } => inspect_run(&config, &run_id),
        Command::Runs => list_runs(&config),
    }
}

fn build_engine(config: EngineConfig, plan: &Path) -> Result<Engine> {
    let planner = StaticPlanner::from_json(&std::fs::read_to_string(plan)?)?;
    let store = FileCheckpointStore::new(config.checkpoints_dir()?);
    Engine::builder(config)
        .tools(builtin_registry())
        .planner(planner)
        .checkpoints(Arc::new(store))
        .build()
}

fn run_plan(config: EngineConfig, plan: &Path, goal: String) -> Result<()> {
    let engine = build_engine(config, plan)?;
    let rt = tokio::runtime::Runtime::new()?;
    let state = rt.block_on(async {
        spawn_ctrl_c(&engine);
        engine.run(goal).await
    })?;
    print_answer(&state)
}

fn resume_run(config: EngineConfig, run_id: &str, plan: &Path) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let engine = build_engine(config, plan)?;
    let rt = tokio::runtime::Runtime::new()?;
    let state = rt.block_on(async {
        spawn_ctrl_c(&engine);
        engine.resume(run_id).await
    })?;
    print_answer(&state)
}

/// Cancel the run on Ctrl-C. In-flight tool calls are allowed to finish.
fn spawn_ctrl_c(engine: &Engine) {
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

fn print_answer(state: &ExecutionState) -> Result<()> {
    match &state.answer {
        Some(answer) => println!("{}", answer),
        None => println!(
            "{}",
            serde_json::to_string_pretty(&JsonSummaryComposer::summary(state))?
        ),
    }
    eprintln!("run {} finished: {}", state.run_id, outcome_label(state));
    Ok(())
}

fn outcome_label(state: &ExecutionState) -> String {
    state
        .outcome
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| state.phase().to_string())
}

fn inspect_run(config: &EngineConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let store = FileCheckpointStore::new(config.checkpoints_dir()?);
    let checkpoint = store.latest(run_id)?;

    println!("Run:        {}", checkpoint.run_id);
    println!("Iteration:  {}", checkpoint.iteration);
    println!("Phase:      {}", checkpoint.phase);
    println!("Saved:      {}", checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Outcome:    {}", outcome_label(&checkpoint.state));
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&JsonSummaryComposer::summary(&checkpoint.state))?
    );
    Ok(())
}

fn list_runs(config: &EngineConfig) -> Result<()> {
    let store = FileCheckpointStore::new(config.checkpoints_dir()?);
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("No runs found in {}", store.root().display());
        return Ok(());
    }
    for run_id in runs {
        match store.latest(run_id) {
            Ok(checkpoint) => println!(
                "{}  iteration {}  {}",
                run_id,
                checkpoint.iteration,
                outcome_label(&checkpoint.state)
            ),
            Err(e) => println!("{}  (unreadable: {})", run_id, e),
        }
    }
    Ok(())
}

fn parse_run_id(id: &str) -> Result<RunId> {
    id.parse()
        .map_err(|e| Error::Config(format!("invalid run id '{}': {}", id, e)))
}
