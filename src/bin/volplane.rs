//! volplane binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volplane::backend::sim::{SimulatedFabric, SimulatedHost};
use volplane::common::{open_store, BackendConfig, Config, DriverKind, Reply};
use volplane::{CreateOptions, Orchestrator};

#[derive(Parser)]
#[command(name = "volplane")]
#[command(about = "Volume and file share lifecycle orchestration", version)]
struct Cli {
    /// Configuration file (TOML); VOLPLANE__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Run a full lifecycle against in-memory arrays and two simulated nodes
    Simulate {
        /// Volumes to create, mount and hand over between nodes
        #[arg(long, default_value = "2")]
        volumes: usize,

        /// Shares to create (more than 16 spills onto a second FPG)
        #[arg(long, default_value = "20")]
        shares: usize,

        /// Seconds a conflicting mount waits before taking over
        #[arg(long, default_value = "2")]
        conflict_delay: u64,
    },
}

fn simulation_config(base: Option<Config>, node_id: &str, conflict_delay: u64) -> Config {
    let mut config = base.unwrap_or_default();
    config.node_id = node_id.to_string();
    config.fencing.mount_conflict_delay_secs = conflict_delay;
    config.fencing.poll_interval_ms = 200;
    if config.backends.is_empty() {
        let mut file = BackendConfig::new("file", DriverKind::File);
        file.ip_pool = (10..=40).map(|n| format!("10.50.0.{}", n)).collect();
        config.backends = vec![BackendConfig::new("block", DriverKind::Iscsi), file];
    }
    config
}

async fn simulate(
    base: Option<Config>,
    volumes: usize,
    shares: usize,
    conflict_delay: u64,
) -> anyhow::Result<()> {
    let config_a = simulation_config(base.clone(), "node-a", conflict_delay);
    let kv = open_store(&config_a.kv)?;
    let fabric = Arc::new(SimulatedFabric::new());

    let node_a = Orchestrator::start(
        config_a,
        kv.clone(),
        Arc::new(SimulatedHost::new("iqn.2024-01.sim:node-a")),
        fabric.clone(),
    );
    let node_b = Orchestrator::start(
        simulation_config(base, "node-b", conflict_delay),
        kv,
        Arc::new(SimulatedHost::new("iqn.2024-01.sim:node-b")),
        fabric,
    );
    for (name, state) in node_a.wait_ready().await {
        tracing::info!("node-a backend {}: {}", name, state);
    }
    node_b.wait_ready().await;

    for i in 0..volumes {
        let name = format!("vol{}", i);
        node_a
            .create_volume(&name, None, CreateOptions::default())
            .await?;
        node_a.mount_volume(&name, "m-a").await?;
        // node-a never unmounts, so node-b takes over after the delay
        let path = node_b.mount_volume(&name, "m-b").await?;
        tracing::info!("{} now mounted on node-b at {}", name, path.mount_dir);
        node_a.unmount_volume(&name, "m-a").await?;
        node_b.unmount_volume(&name, "m-b").await?;
    }

    let mut pending = Vec::new();
    for i in 0..shares {
        let opts = CreateOptions {
            size_gib: Some(10),
            ..Default::default()
        };
        pending.push(node_a.create_share(&format!("share{}", i), None, opts).await?);
    }
    let mut replies = Vec::new();
    for outcome in pending {
        let result = outcome.finish().await;
        if let Err(e) = &result {
            tracing::error!("Share provisioning failed: {}", e);
        }
        replies.push(Reply::from_result(&result));
    }

    let summary = serde_json::json!({
        "volumes": node_a.list_volumes().await?,
        "shares": node_a.list_shares().await?,
        "share_replies": replies,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    node_a.shutdown().await;
    node_b.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Some(Config::load(Some(path))?),
        None => None,
    };

    let default_filter = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::debug!("volplane {}", volplane::BUILD_INFO);

    match cli.command {
        Commands::CheckConfig => {
            let config = match config {
                Some(config) => config,
                None => Config::load(None)?,
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
            tracing::info!(
                "Configuration OK: node {}, {} backend(s)",
                config.node_id,
                config.backends.len()
            );
        }
        Commands::Simulate {
            volumes,
            shares,
            conflict_delay,
        } => {
            simulate(config, volumes, shares, conflict_delay).await?;
        }
    }

    Ok(())
}
