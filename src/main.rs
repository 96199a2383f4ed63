//! CLI entry point for the RSN platform driver.
//!
//! # Usage
//!
//! Poll telemetry and print samples as JSON lines:
//! ```bash
//! rsn-platform-driver run --config config/driver.toml --cycles 3
//! ```
//!
//! Check the OMS link:
//! ```bash
//! rsn-platform-driver ping --config config/driver.toml
//! ```
//!
//! Run one command:
//! ```bash
//! rsn-platform-driver exec --config config/driver.toml \
//!     RSN_PLATFORM_DRIVER_TURN_ON_PORT --arg port_id=J01 --arg src=ops
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rsn_platform_driver::config::DriverConfig;
use rsn_platform_driver::node_config::NodeConfiguration;
use rsn_platform_driver::oms::{OmsClientFactory, SimulatedOms, SimulatedOmsFactory};
use rsn_platform_driver::platform::{
    CommandArgs, DriverAsyncEvent, DriverState, PlatformDriver, PlatformDriverEvent,
};
use rsn_platform_driver::tracing_config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rsn-platform-driver")]
#[command(about = "RSN OMS platform driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and poll engineering telemetry, printing samples as JSON lines
    Run {
        /// Driver configuration file
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many poll cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Connect and ping the OMS once
    Ping {
        /// Driver configuration file
        #[arg(long)]
        config: PathBuf,
    },

    /// Execute one driver event and print its result
    Exec {
        /// Driver configuration file
        #[arg(long)]
        config: PathBuf,

        /// Event name, e.g. RSN_PLATFORM_DRIVER_GET_MISSION_STATUS
        event: String,

        /// Event argument as key=value (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, cycles } => run(&config, cycles).await,
        Commands::Ping { config } => ping(&config).await,
        Commands::Exec {
            config,
            event,
            args,
        } => exec(&config, &event, &args).await,
    }
}

/// Load the configuration, initialise logging and configure a driver.
fn setup(
    config_path: &Path,
) -> Result<(PlatformDriver, tokio::sync::mpsc::UnboundedReceiver<DriverAsyncEvent>)> {
    let config = DriverConfig::load_from(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing_config::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(name = %config.application.name, node_id = %config.driver.node_id, "starting");

    let node = NodeConfiguration::open(&config.driver.node_id, &config.driver.node_cfg_file)?;
    let oms = Arc::new(SimulatedOms::from_node(&node));
    let factory: Arc<dyn OmsClientFactory> = Arc::new(SimulatedOmsFactory::new(oms));

    let (mut driver, events) = PlatformDriver::new(factory);
    driver.configure(config.driver)?;
    Ok((driver, events))
}

async fn run(config_path: &Path, cycles: Option<u64>) -> Result<()> {
    let (mut driver, mut events) = setup(config_path)?;
    driver.connect().await?;

    let handle = driver.handle();
    handle
        .enqueue(PlatformDriverEvent::GetEngData, CommandArgs::new())
        .await?;
    let driver_task = tokio::spawn(async move {
        let result = driver.run_event_loop().await;
        (driver, result)
    });

    let mut completed = 0u64;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DriverAsyncEvent::Sample(sample)) => {
                    println!("{}", serde_json::to_string(&sample)?);
                }
                Some(DriverAsyncEvent::PollCompleted { emitted, skipped_streams }) => {
                    completed += 1;
                    info!(cycle = completed, emitted, skipped = ?skipped_streams, "poll cycle complete");
                    if cycles.is_some_and(|n| completed >= n) {
                        break;
                    }
                }
                Some(DriverAsyncEvent::ConnectionLost { event, reason, .. }) => {
                    warn!(%event, %reason, "connection lost, reconnecting");
                    if let Err(e) = handle.reconnect().await {
                        error!(error = %e, "reconnection failed");
                        break;
                    }
                }
                Some(DriverAsyncEvent::StateChange { state }) => info!(%state, "driver state"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    let (mut driver, result) = driver_task.await?;
    result?;
    if driver.state() == DriverState::Connected {
        driver.disconnect().await?;
    }
    Ok(())
}

async fn ping(config_path: &Path) -> Result<()> {
    let (mut driver, _events) = setup(config_path)?;
    driver.connect().await?;
    let outcome = driver
        .execute(PlatformDriverEvent::Ping, CommandArgs::new())
        .await?;
    println!("{}", outcome.result);
    if driver.state() == DriverState::Connected {
        driver.disconnect().await?;
    }
    Ok(())
}

async fn exec(config_path: &Path, event: &str, args: &[String]) -> Result<()> {
    let event: PlatformDriverEvent = event.parse()?;
    let args = CommandArgs::from_pairs(args)?;

    let (mut driver, _events) = setup(config_path)?;
    driver.connect().await?;
    let outcome = driver.execute(event, args).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if driver.state() == DriverState::Connected {
        driver.disconnect().await?;
    }
    Ok(())
}
