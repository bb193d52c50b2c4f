use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use keygate::clock::{Clock, SystemClock};
use keygate::config::{KeygateConfig, LoggingConfig, StoreBackend, StoreConfig};
use keygate::edge::{EdgeCoordinator, Stores};
use keygate::grpc::GrpcServer;
use keygate::keys::{hash_secret, MemoryKeyStore};
use keygate::mesh::{Cluster, ClusterConfig};
use keygate::ratelimit::MemoryOverrideStore;
use keygate::seed::SeedData;
use keygate::store::{LedgerStore, MemoryLedgerStore, MemoryWindowStore, WindowStore};

#[derive(Parser)]
#[command(name = "keygate", version, about = "Distributed API key verification service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the edge coordinator and its gRPC server
    Serve {
        /// Configuration file (YAML, TOML or JSON)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Print the stored hash of a key secret
    HashKey { secret: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::HashKey { secret } => {
            println!("{}", hash_secret(&secret));
            Ok(())
        }
        Command::Serve { config } => serve(config.as_deref()).await,
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
    Ok(())
}

async fn build_stores(
    config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn WindowStore>, Arc<dyn LedgerStore>)> {
    match config.backend {
        StoreBackend::Memory => Ok((
            Arc::new(MemoryWindowStore::new()),
            Arc::new(MemoryLedgerStore::new()),
        )),
        StoreBackend::Redis => redis_stores(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_stores(
    config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn WindowStore>, Arc<dyn LedgerStore>)> {
    use keygate::store::{RedisLedgerStore, RedisWindowStore, Retrying};

    let url = config
        .redis_url
        .as_deref()
        .context("store.redis_url is required for the redis backend")?;
    let windows = RedisWindowStore::connect(url, &config.key_prefix).await?;
    let ledger = RedisLedgerStore::connect(url, &config.key_prefix).await?;
    info!(prefix = %config.key_prefix, "Connected to Redis");

    Ok((
        Arc::new(Retrying::new(windows, config.retry.clone())),
        Arc::new(Retrying::new(ledger, config.retry.clone())),
    ))
}

#[cfg(not(feature = "redis"))]
async fn redis_stores(
    _config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn WindowStore>, Arc<dyn LedgerStore>)> {
    anyhow::bail!("keygate was built without the `redis` feature")
}

async fn serve(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = KeygateConfig::load(config_path)?;
    init_tracing(&config.logging)?;

    info!("Starting Keygate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        region = %config.edge.region,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let (windows, ledger) = build_stores(&config.store).await?;
    let keys = Arc::new(MemoryKeyStore::new());
    let overrides = Arc::new(MemoryOverrideStore::new());
    let stores = Stores {
        keys: keys.clone(),
        overrides: overrides.clone(),
        windows,
        ledger,
    };
    let mut coordinator = EdgeCoordinator::new(stores, &config.edge, Arc::new(SystemClock));

    if let Some(path) = &config.seed_path {
        SeedData::from_file(path)?
            .apply(&keys, &overrides, coordinator.ledger(), SystemClock.now_ms())
            .await?;
    }

    let mut cluster = None;
    let mut invalidation_poll = Duration::from_millis(250);
    if let Some(mesh) = &config.mesh {
        let node = Arc::new(Cluster::start(ClusterConfig::from(mesh)).await?);
        invalidation_poll = Duration::from_millis(mesh.invalidation_poll_ms.max(1));
        coordinator = coordinator.with_cluster(node.clone());
        cluster = Some(node);
    }

    let coordinator = Arc::new(coordinator);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = coordinator.spawn_background(
        shutdown_rx,
        Duration::from_secs(config.edge.refill_check_interval_secs.max(1)),
        invalidation_poll,
    );

    let server = GrpcServer::bind(config.server.grpc_addr, coordinator.clone()).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    // Stop background work; the flusher drains pending async counts on the way out
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }
    drop(coordinator);

    if let Some(node) = cluster {
        match Arc::try_unwrap(node) {
            Ok(node) => node.shutdown().await?,
            Err(_) => warn!("Cluster still referenced, skipping graceful leave"),
        }
    }

    info!("Keygate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
