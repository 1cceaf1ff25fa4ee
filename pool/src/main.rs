// Solo mining pool: Stratum server, per-wallet block templates, vardiff

use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use solo_pool::api::{self, ApiState};
use solo_pool::blockchain::{DaemonConnector, RpcConnector};
use solo_pool::config::Config;
use solo_pool::pool::Pool;
use solo_pool::pow::{Keccak256Backend, PrefixAddressValidator};
use solo_pool::storage::{BlockStore, MemoryBlockStore, RedisBlockStore};
use solo_pool::stratum::{StratumController, Transport};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = ctrl_c => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

async fn block_store(cfg: &Config) -> anyhow::Result<Arc<dyn BlockStore>> {
    match &cfg.redis_url {
        Some(url) => {
            let store = RedisBlockStore::new(url)?;
            if let Err(e) = store.ping().await {
                tracing::warn!("Redis not reachable yet ({}), will retry on first write", e);
            }
            tracing::info!("Block history in Redis at {}", url);
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Block history kept in memory (POOL_REDIS_URL not set)");
            Ok(Arc::new(MemoryBlockStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cfg = Config::load();
    tracing::info!("Starting solo-pool v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration: {:?}", cfg);

    let connector: Arc<dyn DaemonConnector> = Arc::new(RpcConnector);
    let default_daemon = connector
        .connect(&cfg.daemon_settings())
        .context("building default daemon client")?;
    let store = block_store(&cfg).await?;

    let (transport, events) = Transport::start(cfg.bind_ip, cfg.port)
        .await
        .context("starting stratum transport")?;
    let validator = Arc::new(PrefixAddressValidator::new(
        cfg.address_prefix.clone(),
        cfg.address_length,
    ));
    let controller = Arc::new(StratumController::new(transport.clone(), validator));

    let pool = Pool::new(
        cfg.pool_options(),
        controller,
        connector,
        Arc::new(Keccak256Backend),
        store,
    );
    tokio::spawn(Arc::clone(&pool).run(events));

    let app = api::router(ApiState {
        pool: Arc::clone(&pool),
        daemon: default_daemon,
        hostname: cfg.hostname.clone(),
        port: cfg.port,
    });

    let api_addr = std::net::SocketAddr::new(cfg.bind_ip, cfg.http_port);
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding HTTP API on {}", api_addr))?;
    tracing::info!("HTTP API listening on {}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP API")?;

    pool.shutdown().await;
    transport.shutdown().await;
    tracing::info!("solo-pool shut down cleanly");
    Ok(())
}
