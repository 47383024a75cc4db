//! iotflow daemon: loads configuration, wires the device manager,
//! controller and telemetry collector, and runs until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use iotflow_core::config::{Config, ConfigBuilder};
use iotflow_core::store::MemoryStore;
use iotflow_devices::{AdapterTable, DeviceManager, TcpConnector};
use iotflow_engine::{AutomationRule, DeviceController, TelemetryCollector};
use tracing::{info, warn};

/// Environment variables with this prefix override the configuration file
const ENV_PREFIX: &str = "IOTFLOW";

/// Protocol-agnostic IoT connectivity, control and telemetry engine
#[derive(Parser, Debug)]
#[command(name = "iotflow", author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when it is missing
    #[arg(short, long, default_value = "iotflow.toml")]
    config: PathBuf,

    /// Log filter overriding the configured level, e.g. `iotflow_devices=debug`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Automation rules to load at startup (JSON array)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = ConfigBuilder::new()
        .with_config_file(&args.config)
        .with_environment_prefix(ENV_PREFIX)
        .build()
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn load_rules(path: &Path) -> Result<Vec<AutomationRule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules from {}", path.display()))?;
    let rules: Vec<AutomationRule> = serde_json::from_str(&text)
        .with_context(|| format!("parsing rules in {}", path.display()))?;
    for rule in &rules {
        rule.validate()
            .with_context(|| format!("rule '{}' in {}", rule.name, path.display()))?;
    }
    Ok(rules)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    iotflow_core::init(&config)?;
    iotflow_devices::init()?;
    iotflow_engine::init()?;

    let store = Arc::new(MemoryStore::new());
    let connector = Arc::new(TcpConnector::new(config.commands.connect_timeout()));
    let manager = Arc::new(DeviceManager::new(
        &config,
        store,
        AdapterTable::builtin(connector),
    ));
    let controller = Arc::new(DeviceController::new(&config, manager.clone()));
    let collector = Arc::new(TelemetryCollector::new(&config.telemetry, manager.clone()));

    if let Some(path) = &args.rules {
        for rule in load_rules(path)? {
            let name = rule.name.clone();
            match controller.add_rule(rule) {
                Ok(rule_id) => info!(rule_id = %rule_id, rule = %name, "rule loaded"),
                Err(e) => warn!(rule = %name, error = %e, "rule rejected"),
            }
        }
    }

    manager.start().await?;
    collector.attach()?;
    collector.start();
    controller.start().await?;
    info!(
        app = %config.general.app_name,
        env = %config.general.environment,
        "iotflow running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for the shutdown signal")?;

    info!("shutting down");
    controller.stop().await;
    collector.stop().await;
    manager.stop().await;
    Ok(())
}
