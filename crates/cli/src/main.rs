use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sneebly_core::Engine;
use sneebly_provider::AnthropicProvider;

#[derive(Parser)]
#[command(name = "sneebly", about = "Self-improving maintenance engine for web apps", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Host project root (defaults to the current directory)
    #[arg(short, long)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory and identity baseline
    Init,
    /// Run the continuous monitoring and improvement loops
    Run,
    /// Run a single heartbeat tick
    Heartbeat,
    /// Run one constraint-solver pass
    Elon,
    /// Plan and build against declared roadmap goals
    Build {
        /// The goals text handed to the planner
        goals: String,
    },
    /// Show queues, blockers, and budget configuration
    Status,
    /// Approve a pending spec by id
    Approve {
        /// Spec id from queue/pending/
        id: String,
    },
    /// Toggle dev mode (pauses autonomous mutation)
    DevMode {
        /// "on" or "off"
        state: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sneebly=info".parse().expect("valid directive")),
        )
        .with_target(false)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = cli
        .root
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let data_dir = sneebly_config::data_dir(&root);
    let config = sneebly_config::Config::load(&data_dir)?;

    match cli.command {
        Commands::Init => {
            let engine = Engine::new(&root, config, offline_provider()?);
            engine.initialize()?;
            println!("Initialized .sneebly/ in {}", root.display());
            Ok(())
        }
        Commands::Run => {
            let provider = live_provider(&config)?;
            let engine = Engine::new(&root, config, provider);
            engine.run_forever().await
        }
        Commands::Heartbeat => {
            let provider = live_provider(&config)?;
            let engine = Engine::new(&root, config, provider);
            engine.initialize()?;
            let report = engine.heartbeat_tick().await?;
            println!(
                "identity={} host_up={} drained={} triaged={} specs_run={}",
                report.identity_ok,
                report.host_up,
                report.errors_drained,
                report.errors_triaged,
                report.specs_run
            );
            if !report.identity_ok {
                anyhow::bail!("identity verification failed; autonomous mutation halted");
            }
            Ok(())
        }
        Commands::Elon => {
            let provider = live_provider(&config)?;
            let engine = Engine::new(&root, config, provider);
            engine.initialize()?;
            let summary = engine.elon_run().await?;
            println!(
                "cycles={} solved={} dismissed={}",
                summary.cycles, summary.solved, summary.dismissed
            );
            if let Some(reason) = summary.halted {
                // Rate-limit and friends surface their classified kind.
                anyhow::bail!("solver halted: {reason}");
            }
            Ok(())
        }
        Commands::Build { goals } => {
            let provider = live_provider(&config)?;
            let engine = Engine::new(&root, config, provider);
            engine.initialize()?;
            match engine.planner_run(&goals).await? {
                Some(plan) => {
                    for step in &plan.steps {
                        println!("{:?} {} - {}", step.status, step.id, step.description);
                    }
                    Ok(())
                }
                None => anyhow::bail!("planner produced no usable step graph"),
            }
        }
        Commands::Status => {
            let engine = Engine::new(&root, config, offline_provider()?);
            engine.initialize()?;
            let store = sneebly_core::store::SpecStore::new(&engine.paths);
            let blockers = sneebly_core::blockers::BlockerStore::new(&engine.paths);
            println!(
                "pending={} approved={} completed={} failed={} active_blockers={}",
                store.list(sneebly_core::store::Queue::Pending).len(),
                store.list(sneebly_core::store::Queue::Approved).len(),
                store.list(sneebly_core::store::Queue::Completed).len(),
                store.list(sneebly_core::store::Queue::Failed).len(),
                blockers.active().len(),
            );
            println!(
                "budget: max=${:.2}/cycle warning=${:.2}",
                engine.config.budget.max_per_cycle, engine.config.budget.warning
            );
            Ok(())
        }
        Commands::Approve { id } => {
            let engine = Engine::new(&root, config, offline_provider()?);
            let store = sneebly_core::store::SpecStore::new(&engine.paths);
            store.approve(&id)?;
            let decisions = sneebly_core::decisions::DecisionLog::new(&engine.paths);
            decisions.record(
                "spec-approved",
                serde_json::json!({
                    "id": id,
                    "by": engine.config.app.owner_email.clone().unwrap_or_else(|| "owner".into()),
                }),
            )?;
            println!("approved {id}");
            Ok(())
        }
        Commands::DevMode { state } => {
            let engine = Engine::new(&root, config, offline_provider()?);
            let enabled = match state.as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("expected on/off, got {other}"),
            };
            let by = engine
                .config
                .app
                .owner_email
                .clone()
                .unwrap_or_else(|| "owner".into());
            sneebly_core::dev_mode::set(&engine.paths, enabled, &by)?;
            println!("dev mode {}", if enabled { "enabled" } else { "disabled" });
            Ok(())
        }
    }
}

fn live_provider(config: &sneebly_config::Config) -> Result<Arc<AnthropicProvider>> {
    Ok(Arc::new(AnthropicProvider::from_config(config)?))
}

/// Commands that never talk to the vendor still need a provider to build
/// the engine handle.
fn offline_provider() -> Result<Arc<AnthropicProvider>> {
    Ok(Arc::new(AnthropicProvider::new(String::new(), None)))
}
