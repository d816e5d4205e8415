//! musterd — the Muster fleet control plane head process.
//!
//! Hosts the long-running coordination tasks: the model-aware vision
//! scheduler, the auto-scaler ticker, the fleet doctor, and the operator
//! WebSocket bridge. All shared state lives in the state store; the HTTP
//! surface layer plugs into the same library crates this binary wires up.

use clap::{Parser, Subcommand};
use muster_doctor::{Doctor, HttpActionRunner, LlmOracle};
use muster_events::EventBus;
use muster_queue::JobQueue;
use muster_registry::NodeRegistry;
use muster_scaler::AutoScaler;
use muster_scheduler::{HttpWorkerApi, Scheduler};
use muster_store::{MemoryStore, StateStore, keys};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod ws;

use config::HeadConfig;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "musterd")]
#[command(about = "Muster GPU fleet control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the head process (scheduler, scaler, doctor, event bridge)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/musterd/config.json")]
        config: PathBuf,
    },

    /// Validate configuration and print the effective settings
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/musterd/config.json")]
        config: PathBuf,
    },

    /// Write a default config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/musterd/config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("musterd=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_head(config).await,
        Commands::Check { config } => check(config).await,
        Commands::InitConfig { output } => init_config(output),
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_head(config_path: PathBuf) -> anyhow::Result<()> {
    let config = HeadConfig::load(&config_path)?;
    info!(
        config = %config_path.display(),
        ws_bind = %config.ws_bind,
        doctor = config.doctor_enabled,
        scaler = config.scaler_enabled,
        "starting musterd"
    );

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::with_snapshot(
        config.state_path.join("state").join("store.json"),
    ));
    let shared: Arc<dyn StateStore> = store.clone();
    let bus = EventBus::new(shared.clone());

    let registry = NodeRegistry::new(shared.clone(), bus.clone())
        .with_heartbeat_ttl(Duration::from_secs(config.heartbeat_ttl_s));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Vision scheduler: single dispatcher task.
    let scheduler = Scheduler::new(shared.clone(), bus.clone(), Arc::new(HttpWorkerApi::new()));
    {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(rx).await }));
    }

    // Auto-scaler ticker.
    if config.scaler_enabled {
        let scaler = AutoScaler::new(shared.clone(), bus.clone());
        if shared.get(keys::SCALING_CONFIG).await?.is_none() {
            scaler.set_config(&config.scaler).await?;
        }
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scaler.run(rx).await }));
    }

    // Fleet doctor.
    if config.doctor_enabled {
        let doctor = Arc::new(Doctor::new(
            shared.clone(),
            bus.clone(),
            Arc::new(HttpActionRunner::new(config.api_base.clone())),
            Arc::new(LlmOracle::new(
                config.llm_endpoint.clone(),
                config.llm_model.clone(),
            )),
            config.doctor.clone(),
        ));
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { doctor.run(rx).await }));
    }

    // Operator event streams.
    {
        let bridge = ws::WsBridge::new(shared.clone(), registry.clone());
        let bind = config.ws_bind.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = bridge.serve(&bind, rx).await {
                error!(error = %e, "websocket bridge failed");
            }
        }));
    }

    // Periodic store snapshot so restarts keep registrations and queues.
    {
        let store = store.clone();
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {
                        if let Err(e) = store.snapshot() {
                            error!(error = %e, "store snapshot failed");
                        }
                    }
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown_tx.send(true)?;
    for task in tasks {
        let _ = task.await;
    }
    store.snapshot()?;
    info!("musterd stopped");
    Ok(())
}

// ─── Check ───────────────────────────────────────────────────────────────────

async fn check(config_path: PathBuf) -> anyhow::Result<()> {
    let config = HeadConfig::load(&config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::with_snapshot(
        config.state_path.join("state").join("store.json"),
    ));
    let bus = EventBus::new(store.clone());
    let queue = JobQueue::new(store.clone(), bus);

    let stats = queue.stats().await?;
    println!();
    println!("state store:     ok ({})", config.state_store_url);
    println!(
        "queue depths:    high={} normal={} low={} processing={}",
        stats.depths.high, stats.depths.normal, stats.depths.low, stats.processing
    );
    println!("active nodes:    {}", stats.active_nodes);
    Ok(())
}

// ─── InitConfig ──────────────────────────────────────────────────────────────

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = HeadConfig::default();
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file, then run:");
    println!("  musterd run --config {}", output.display());
    Ok(())
}
