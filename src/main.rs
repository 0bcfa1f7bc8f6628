//! agreement-node: device-side agreement lifecycle manager
//!
//! Keeps the device's agreements consistent between the local store, the
//! exchange and the ledgers, and advertises the device's policies.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use agreement_node::config::Config;
use agreement_node::events::{Event, OutboundEvent};
use agreement_node::exchange::ExchangeClient;
use agreement_node::policy::PolicyManager;
use agreement_node::storage::{AgreementStore, ExchangeDevice, SqliteStore};
use agreement_node::worker::AgreementWorker;

#[derive(Parser)]
#[command(name = "agreement-node")]
#[command(about = "Device-side agreement lifecycle manager")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agreement-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "AGREEMENT_DATA_DIR")]
    data_dir: Option<String>,

    /// Device ID (overrides config file)
    #[arg(long, env = "AGREEMENT_DEVICE_ID")]
    device_id: Option<String>,

    /// Exchange URL (overrides config file)
    #[arg(long, env = "AGREEMENT_EXCHANGE_URL")]
    exchange_url: Option<String>,

    /// Policy directory (overrides config file)
    #[arg(long, env = "AGREEMENT_POLICY_PATH")]
    policy_path: Option<String>,

    /// Register the device with this exchange token before starting
    #[arg(long, env = "AGREEMENT_DEVICE_TOKEN")]
    token: Option<String>,

    /// Device name used with --token
    #[arg(long, env = "AGREEMENT_DEVICE_NAME")]
    device_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agreement_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting agreement-node");
    info!("Config file: {}", cli.config);

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        Config::from_toml(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(device_id) = cli.device_id {
        config.node.device_id = device_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(url) = cli.exchange_url {
        config.exchange.url = agreement_node::config::normalize_url(&url);
    }
    if let Some(policy_path) = cli.policy_path {
        config.edge.policy_path = PathBuf::from(policy_path);
    }

    info!("Device ID: {}", config.node.device_id);
    info!("Exchange: {}", config.exchange.url);
    info!("Data dir: {}", config.node.data_dir.display());

    std::fs::create_dir_all(&config.node.data_dir)?;
    let store = Arc::new(SqliteStore::open(&config.node.data_dir)?);

    if let Some(token) = cli.token {
        let name = cli
            .device_name
            .unwrap_or_else(|| config.node.device_id.clone());
        store.save_exchange_device(&ExchangeDevice {
            id: config.node.device_id.clone(),
            token,
            name,
        })?;
        info!("Stored exchange registration for {}", config.node.device_id);
    }

    let policy_manager = match PolicyManager::from_dir(&config.edge.policy_path) {
        Ok(pm) => pm,
        Err(e) => {
            warn!(
                path = %config.edge.policy_path.display(),
                error = %e,
                "Unable to load policies, starting with none"
            );
            PolicyManager::new()
        }
    };
    info!("Loaded {} policies", policy_manager.get_all_policies().len());

    let exchange = Arc::new(ExchangeClient::new(
        &config.exchange,
        &config.node.device_id,
        "",
    )?);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let outbound_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            match &event {
                OutboundEvent::AgreementCancelation {
                    agreement_id,
                    reason,
                    ..
                } => info!(agreement_id = %agreement_id, reason, "Agreement cancellation requested"),
                OutboundEvent::NewBlockchainClient { bc_type, bc_name, .. } => {
                    info!(bc_type = %bc_type, bc_name = %bc_name, "Ledger client requested")
                }
                OutboundEvent::DeviceAgreementsSynced { completed } => {
                    info!(completed, "Device agreements synced")
                }
            }
        }
    });

    let (worker, handle) = AgreementWorker::new(
        Arc::new(config),
        store,
        Arc::new(policy_manager),
        exchange,
        outbound_tx,
    )?;
    let worker_task = tokio::spawn(worker.run());

    // No container runtime is managed here, so containers are always in sync.
    handle.new_event(Event::DeviceContainersSynced { completed: true });

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_handle.terminate("shutdown signal");
        }
    });

    let result = worker_task.await?;
    outbound_task.abort();

    if let Err(e) = result {
        error!(error = %e, "Agreement worker failed");
        return Err(e.into());
    }

    info!("agreement-node stopped");
    Ok(())
}
