use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use leadforge::config::AppConfig;
use leadforge::events::EventBus;
use leadforge::metrics::RuntimeMetrics;
use leadforge::reconciler::{CounterReconciler, ReconcilePolicy};
use leadforge::server;
use leadforge::store::{CampaignStore, DbHandle};

#[derive(Parser)]
#[command(name = "leadforge")]
#[command(version, about = "Lead-generation campaign orchestration engine")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and background workers (default)
    Serve {
        /// Override SERVER_PORT from the environment
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one counter-reconciliation pass and exit
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            server::start_server(config).await
        }
        Commands::Reconcile => {
            let store = CampaignStore::open(std::path::Path::new(config.db.database_path()))
                .context("Failed to open campaign store")?;
            let reconciler = CounterReconciler::new(
                DbHandle::new(store),
                EventBus::new(),
                RuntimeMetrics::new(),
                ReconcilePolicy {
                    drift_window_secs: 0, // examine everything on a manual pass
                    drift_threshold_pct: config.reconcile_drift_threshold_pct,
                    auto_correct: config.reconcile_auto_correct,
                    max_corrections: config.reconcile_max_corrections,
                },
            );
            let report = reconciler.run_once().await.map_err(|e| {
                anyhow::anyhow!("reconcile pass failed: {}", e)
            })?;
            println!(
                "examined {} campaigns, corrected {}, {} drift events",
                report.examined, report.corrected, report.drift_events
            );
            Ok(())
        }
    }
}
