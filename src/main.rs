use clap::{Parser, Subcommand};
use crewly_core::budget::{BudgetGuard, BudgetsConfig, UsageLedger};
use crewly_core::config::Config;
use crewly_core::gates::{GateRunOptions, QualityGateRunner};
use crewly_core::notify::InMemoryNotifier;
use crewly_core::runtime::Orchestrator;
use crewly_core::self_improve::{GitOperations, MarkerStore};
use crewly_core::session::ScriptedSessionPort;
use crewly_core::CrewlyError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crewly-core", about = "Continuation and quality control core for the Crewly agent orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator core with its RPC surface
    Serve,
    /// Run the quality gates for a project and report results
    CheckGates {
        /// Project directory (defaults to the configured project path)
        #[arg(long)]
        project: Option<PathBuf>,
        /// Restrict the run to these gate names
        #[arg(long)]
        gate: Vec<String>,
    },
    /// Show budget status for an agent
    BudgetStatus {
        agent_id: String,
    },
    /// Show the pending self-improvement marker, if any
    SelfImproveStatus,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let exit_code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> crewly_core::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::CheckGates { project, gate } => check_gates(config, project, gate).await,
        Command::BudgetStatus { agent_id } => budget_status(config, &agent_id).await,
        Command::SelfImproveStatus => self_improve_status(config).await,
    }
}

async fn serve(config: Config) -> crewly_core::Result<()> {
    info!("Starting Crewly Core");

    // The PTY adapter is provided by the external session manager; the
    // scripted port keeps a single-binary deployment functional until
    // one is attached over the port seam.
    let port = Arc::new(ScriptedSessionPort::new());
    let orchestrator = Orchestrator::bootstrap(config, port).await?;
    orchestrator.start().await;

    let api = orchestrator.api.clone();
    tokio::select! {
        result = api.run() => {
            if let Err(e) = result {
                error!("API server failed: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    orchestrator.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn check_gates(
    config: Config,
    project: Option<PathBuf>,
    gates: Vec<String>,
) -> crewly_core::Result<()> {
    let project_path = project.unwrap_or_else(|| config.home.project_path.clone());
    let options = GateRunOptions {
        gate_names: if gates.is_empty() { None } else { Some(gates) },
        current_branch: GitOperations::current_branch(&project_path),
        ..Default::default()
    };

    let run = QualityGateRunner::new()
        .run_all(&project_path, &options)
        .await?;
    for result in &run.results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        println!(
            "{status} {} ({}ms){}",
            result.name,
            result.duration_ms,
            result
                .error
                .as_ref()
                .map(|e| format!(" [{e}]"))
                .unwrap_or_default()
        );
    }
    println!(
        "all required passed: {} ({}ms total)",
        run.all_required_passed, run.duration_ms
    );

    if run.all_required_passed {
        Ok(())
    } else {
        let failed = run
            .results
            .iter()
            .find(|r| r.required && !r.passed)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        Err(CrewlyError::GateFailed { gate: failed })
    }
}

async fn budget_status(config: Config, agent_id: &str) -> crewly_core::Result<()> {
    let budgets = BudgetsConfig::load(&config.home.budgets_file())?;
    let guard = BudgetGuard::new(
        UsageLedger::new(config.home.usage_dir()),
        budgets,
        Arc::new(InMemoryNotifier::new()),
    );
    let project = config.home.project_path.display().to_string();
    let status = guard.check_budget(agent_id, &project).await?;

    println!("agent:            {agent_id}");
    println!("daily used:       ${:.2}", status.daily_used);
    match status.daily_limit {
        Some(limit) => println!("daily limit:      ${limit:.2}"),
        None => println!("daily limit:      unlimited"),
    }
    println!("percent used:     {:.0}%", status.percent_used * 100.0);
    println!("estimated runway: {}", status.estimated_runway);

    if status.within_budget {
        Ok(())
    } else {
        Err(CrewlyError::BudgetExceeded {
            scope_id: agent_id.to_string(),
            message: "daily limit reached".to_string(),
        })
    }
}

async fn self_improve_status(config: Config) -> crewly_core::Result<()> {
    let store = MarkerStore::new(config.home.self_improvement_dir());
    match store.load().await? {
        Some(marker) => {
            println!("marker:     {}", marker.id);
            println!("phase:      {}", marker.phase.as_str());
            println!("restarts:   {}", marker.restart_count);
            println!("targets:    {}", marker.target_files.join(", "));
            if let Some(error) = &marker.error {
                println!("error:      {error}");
            }
        }
        None => println!("no pending self-improvement"),
    }
    Ok(())
}
