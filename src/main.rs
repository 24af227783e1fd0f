//! CLI entry point for the airnode sensor node.
//!
//! Loads the TOML settings, brings the particulate sensor up, then runs the
//! node loop: one sample tick per configured sampling period, with inbound
//! management commands handled between ticks and a clean device shutdown on
//! Ctrl+C.
//!
//! # Usage
//!
//! Run against the mocked sensor bus (no hardware required):
//! ```bash
//! airnode run --config config/airnode.toml
//! ```
//!
//! With the `bus_serial` feature, run against a serial-attached sensor:
//! ```bash
//! airnode run --config config/airnode.toml --serial /dev/ttyS0
//! ```

use airnode::config::ConfigStore;
use airnode::msgbus::{MemoryBus, MessageBus};
use airnode::node::Node;
use airnode::opc::{mock::ScriptedChannel, BusChannel, OpcDriver};
use airnode::sensors::mock::{MockAuxSensors, MockGps, MockSecondaryPm};
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "airnode")]
#[command(about = "Unattended environmental sensor node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sensor node loop
    Run {
        /// Path to the TOML settings file
        #[arg(long, default_value = "config/airnode.toml")]
        config: PathBuf,

        /// Serial device of the particulate sensor bus (mocked when absent)
        #[cfg(feature = "bus_serial")]
        #[arg(long)]
        serial: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "bus_serial")]
        Commands::Run { config, serial } => {
            if let Some(path) = serial {
                let channel = airnode::opc::serial::SerialBusChannel::open(&path, 9600)?;
                run_node(&config, channel).await
            } else {
                run_node(&config, mock_channel()).await
            }
        }
        #[cfg(not(feature = "bus_serial"))]
        Commands::Run { config } => run_node(&config, mock_channel()).await,
    }
}

/// A scripted bus that answers startup commands and then yields frames of
/// slowly varying particulate values, enough to exercise the whole loop.
fn mock_channel() -> ScriptedChannel {
    let mut channel = ScriptedChannel::new();
    channel.push_startup();
    for i in 0..86_400u32 {
        let base = 8.0 + f64::from(i % 60) * 0.05;
        channel.push_sample(base as f32, (base * 1.4) as f32, (base * 2.1) as f32);
    }
    channel
}

async fn run_node<C: BusChannel + 'static>(config_path: &PathBuf, channel: C) -> Result<()> {
    let config = Arc::new(ConfigStore::load(config_path)?);
    let settings = config.settings();
    info!(
        "starting sensor node {} (sampling period {} s)",
        settings.node_id, settings.sampling_period_secs
    );

    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let node = Node::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        OpcDriver::new(channel),
        Arc::new(MockGps::default()),
        Arc::new(MockAuxSensors),
        Arc::new(MockSecondaryPm),
    )?;
    node.start().await;

    let mut commands = bus.subscribe(&node.topics().management);
    let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(
        settings.sampling_period_secs.max(1),
    )));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                node.tick().await;
                // The period may have been changed by SET_SAMPLING_PERIOD.
                let period = config.settings().sampling_period_secs.max(1);
                if ticker.period() != Duration::from_secs(u64::from(period)) {
                    ticker = tokio::time::interval(Duration::from_secs(u64::from(period)));
                    ticker.reset();
                }
            }
            payload = commands.recv() => {
                match payload {
                    Ok(payload) => node.handle_command(&payload).await,
                    Err(err) => {
                        log::warn!("management subscription lapsed: {err}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
