//! Command-line interface for the agvlink telegram engine.

mod link;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agvlink_core::config::env_vars;
use agvlink_core::{EngineConfig, EngineEvent, MatcherConfig};
use agvlink_dispatch::{Engine, IncomingOutcome, VehicleProperties};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use link::LinkEvent;

/// agvlink - Telegram dispatch for AGV fleets.
#[derive(Parser, Debug)]
#[command(name = "agvlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the configured vehicles and run the engine.
    Serve {
        /// Engine configuration file (TOML).
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Decode one telegram and print it as JSON.
    Decode {
        /// The raw telegram.
        line: String,
        /// Take the telegram format from this configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file and list its vehicles.
    Check {
        /// Engine configuration file (TOML).
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve { config } => run_serve(&config).await,
        Command::Decode { line, config } => run_decode(&line, config.as_deref()),
        Command::Check { config } => run_check(&config),
    }
}

fn init_logging(verbose: bool) {
    // JSON output for container deployments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "agvlink=debug" } else { "agvlink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_serve(path: &Path) -> Result<()> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    let engine = Arc::new(Engine::new(config.clone()));

    let mut workers = Vec::with_capacity(config.vehicles.len());
    for vehicle in &config.vehicles {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let transport = link::open_link(config.channel, &vehicle.name, link_tx);
        engine
            .add_vehicle(vehicle, transport)
            .with_context(|| format!("adding vehicle {}", vehicle.name))?;
        workers.push(spawn_link_worker(engine.clone(), link_rx));
    }

    let mut events = engine.events().subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some((event, meta)) = events.recv().await {
            log_event(&event, &meta.source);
        }
    });

    engine.start().await;
    println!(
        "agvlink serving {} vehicle(s) over {:?}, press Ctrl+C to stop",
        config.vehicles.len(),
        config.channel
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    tracing::info!("Shutdown requested");

    engine.shutdown().await;
    for worker in workers {
        worker.abort();
    }
    event_logger.abort();
    Ok(())
}

/// Feed one vehicle's link events into the engine, in arrival order.
///
/// Each vehicle has its own worker, so a slow handler only delays telegrams
/// of the vehicle it is handling.
fn spawn_link_worker(
    engine: Arc<Engine>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_link_event(&engine, event).await;
        }
    })
}

async fn handle_link_event(engine: &Engine, event: LinkEvent) {
    match event {
        LinkEvent::Line { vehicle, line } => match engine.on_incoming_telegram(&line).await {
            Ok(IncomingOutcome::Dispatched { response, .. }) if !response.is_ok() => {
                tracing::warn!(
                    vehicle = %vehicle,
                    status = response.status,
                    code = %response.code,
                    reason = %response.payload,
                    "Telegram not handled"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(vehicle = %vehicle, error = %e, "Telegram rejected"),
        },
        LinkEvent::Closed { vehicle } => {
            if let Some(adapter) = engine.directory().get(&vehicle) {
                adapter.on_disconnect();
            }
        }
    }
}

fn log_event(event: &EngineEvent, source: &str) {
    if event.is_fault() {
        tracing::warn!(
            event = event.type_name(),
            vehicle = %event.subject(),
            source = %source,
            detail = ?event,
            "Engine fault"
        );
    } else {
        tracing::info!(
            event = event.type_name(),
            vehicle = %event.subject(),
            source = %source,
            "Engine event"
        );
    }
}

fn run_decode(line: &str, config: Option<&Path>) -> Result<()> {
    let matcher = match config {
        Some(path) => EngineConfig::load(path)?.matcher,
        None => MatcherConfig::default(),
    }
    .build();

    let protocol = matcher.decode(line).context("decoding telegram")?;
    println!("{}", serde_json::to_string_pretty(&protocol)?);
    Ok(())
}

fn run_check(path: &Path) -> Result<()> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    println!(
        "Configuration OK: {:?} channel, {} vehicle(s)",
        config.channel,
        config.vehicles.len()
    );
    for vehicle in &config.vehicles {
        let props = VehicleProperties::from_config(vehicle, config.channel)
            .with_context(|| format!("vehicle {}", vehicle.name))?;
        let devices: Vec<&str> = props.device_ids().collect();
        println!(
            "  {} at {} (devices: {})",
            props.name,
            props.address(),
            devices.join(", ")
        );
    }
    Ok(())
}
