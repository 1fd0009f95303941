//! Patchbay CLI
//!
//! Loads a topology, builds the policy manager over the in-memory HAL and
//! runs a scripted routing scenario, printing the manager state and the HAL
//! command stream. Useful for eyeballing policy decisions without hardware.

use clap::{Parser, Subcommand};
use patchbay_core::domain::audio::{
    ForceUsage, ForcedConfig, PhoneState, Session, StreamType,
};
use patchbay_core::domain::config::TopologyConfig;
use patchbay_core::domain::device::DeviceType;
use patchbay_core::domain::engine::DefaultVendorHooks;
use patchbay_core::domain::manager::PolicyManager;
use patchbay_infra::FakeHal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "patchbay")]
#[command(about = "Audio routing policy engine", long_about = None)]
struct Cli {
    /// Topology file (TOML); defaults to the built-in topology
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the boot-time manager state
    Dump,
    /// Run a headset plug/unplug scenario with music playing
    Scenario,
    /// List the routing graph ports as JSON
    Ports,
    /// Write the built-in topology to a file
    WriteConfig {
        #[arg(default_value = "patchbay.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => TopologyConfig::load_from_file(path).await?,
        None => TopologyConfig::factory_default(),
    };

    match cli.command {
        Command::WriteConfig { path } => {
            TopologyConfig::factory_default().save_to_file(&path).await?;
            info!(path = %path.display(), "topology written");
            return Ok(());
        }
        Command::Dump => {
            let hal = Arc::new(FakeHal::new());
            let manager =
                PolicyManager::new(&config, hal, Arc::new(DefaultVendorHooks))?;
            print!("{}", manager.dump());
        }
        Command::Ports => {
            let hal = Arc::new(FakeHal::new());
            let manager =
                PolicyManager::new(&config, hal, Arc::new(DefaultVendorHooks))?;
            println!("{}", serde_json::to_string_pretty(&manager.list_audio_ports())?);
        }
        Command::Scenario => {
            let hal = Arc::new(FakeHal::new());
            let mut manager =
                PolicyManager::new(&config, hal.clone(), Arc::new(DefaultVendorHooks))?;
            run_scenario(&mut manager)?;
            print!("{}", manager.dump());
            println!("--- HAL commands ---");
            for command in hal.commands() {
                println!("{command:?}");
            }
        }
    }
    Ok(())
}

/// Music starts on the speaker, a headset is plugged and unplugged, then a
/// call comes in and ends.
fn run_scenario(manager: &mut PolicyManager) -> anyhow::Result<()> {
    let session = Session::new(4242);
    let output = manager.get_output(StreamType::Music)?;
    manager.start_output(output, StreamType::Music, session)?;
    info!(%output, "music started");

    manager.set_device_connection_state(DeviceType::WiredHeadset, "", true)?;
    info!("headset plugged");
    manager.set_device_connection_state(DeviceType::WiredHeadset, "", false)?;
    info!("headset unplugged");

    manager.set_phone_state(PhoneState::InCall)?;
    manager.set_force_use(ForceUsage::Communication, ForcedConfig::Speaker)?;
    manager.set_phone_state(PhoneState::Normal)?;
    info!("call finished");

    manager.stop_output(output, StreamType::Music, session)?;
    manager.release_output(output, session);
    Ok(())
}
