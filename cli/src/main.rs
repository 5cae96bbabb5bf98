// nmp: Nearby Multipeer command-line tools
//
// Loopback simulator, advertisement classifier and config inspection for the
// dual-transport engine.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use nearby_multipeer_core::transport::{
    AdvertisementClassifier, AdvertisementRecord, ManufacturerPayload, PeripheralHandle,
};
use nearby_multipeer_core::{init_logging, parse_service_uuid, LogLevel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nmp")]
#[command(about = "Nearby Multipeer: dual-transport discovery tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level 0 (off) to 5 (trace)
    #[arg(long, global = true)]
    log_level: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two loopback devices through discover, connect, message, disconnect
    Simulate {
        /// Connect over BLE instead of the session protocol
        #[arg(long)]
        ble: bool,
        /// Service id override
        #[arg(long)]
        service_id: Option<String>,
        /// Local display name override
        #[arg(long)]
        name: Option<String>,
        /// Peer display name override
        #[arg(long)]
        peer_name: Option<String>,
        /// Message sent once connected
        #[arg(long, default_value = "hello")]
        message: String,
    },
    /// Classify a manufacturer payload given as hex
    Classify {
        payload: String,
        /// Local name carried next to the payload
        #[arg(long)]
        local_name: Option<String>,
    },
    /// Normalize a service UUID
    Uuid { value: String },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Set a value and save
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load_from(path)?,
        None => CliConfig::load()?,
    };
    if let Some(level) = cli.log_level {
        config.engine.log_level = LogLevel::try_from(level)?;
    }
    init_logging(config.engine.log_level);

    match cli.command {
        Commands::Simulate {
            ble,
            service_id,
            name,
            peer_name,
            message,
        } => {
            if let Some(service_id) = service_id {
                config.engine.service_id = service_id;
            }
            if let Some(name) = name {
                config.engine.display_name = name;
            }
            if let Some(peer_name) = peer_name {
                config.peer_name = peer_name;
            }
            config.engine.validate()?;
            simulate::run(
                config.engine,
                config.peer_name,
                simulate::SimulateOptions { ble, message },
            )
            .await
        }
        Commands::Classify {
            payload,
            local_name,
        } => cmd_classify(&config, &payload, local_name),
        Commands::Uuid { value } => cmd_uuid(&value),
        Commands::Config { action } => cmd_config(config, cli.config, action),
    }
}

fn cmd_classify(config: &CliConfig, payload: &str, local_name: Option<String>) -> Result<()> {
    let cleaned: String = payload
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(&cleaned).context("Payload is not valid hex")?;

    let service_uuid = config.engine.resolved_service_uuid()?;
    let classifier = AdvertisementClassifier::new(service_uuid);
    let record = AdvertisementRecord {
        peripheral: PeripheralHandle::new("cli"),
        rssi: 0,
        local_name,
        service_uuids: vec![service_uuid],
        manufacturer_data: Some(bytes.clone()),
    };

    println!("{}", "Advertisement".bold());
    println!("  Bytes:   {}", hex::encode_upper(&bytes).dimmed());

    match classifier.classify(&record) {
        Ok(classified) => {
            println!("  Family:  {}", classified.family);
            println!("  Name:    {}", classified.display_name);
            if let Ok(payload) = ManufacturerPayload::decode(&bytes) {
                let advertised = payload.name.unwrap_or_else(|| "(none)".to_string());
                println!("  Payload: {}", advertised.dimmed());
            }
            println!("{} Mesh member", "✓".green());
        }
        Err(e) => {
            println!("{} Rejected: {}", "✗".red(), e);
        }
    }
    Ok(())
}

fn cmd_uuid(value: &str) -> Result<()> {
    let uuid = parse_service_uuid(value)?;
    println!("{}", uuid.hyphenated());
    Ok(())
}

fn cmd_config(mut config: CliConfig, path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => CliConfig::config_file()?,
    };

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
            if !path.exists() {
                println!();
                println!("  {}", "(defaults, no config file)".dimmed());
            }
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).context("Failed to create config directory")?;
            }
            config.save_to(&path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}
