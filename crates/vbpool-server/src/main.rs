use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use vbpool_manager::{PoolConfig, PoolManager};
use vbpool_provider::{build_provider, ProviderAccountConfig, VmProvider};
use vbpool_server::config::{PoolEntry, ProviderCredentials, ServerConfig};
use vbpool_server::app;
use vbpool_server::state::AppState;
use vbpool_storage::VmStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vbpool=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.toml".to_string());
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("Failed to load config '{config_path}'"))?;

    let store = Arc::new(VmStore::connect(&config.database_url).await?);

    let mut pools: HashMap<String, Arc<PoolManager>> = HashMap::new();
    for entry in &config.pools {
        let credentials = config.credentials_for(&entry.provider).with_context(|| {
            format!("Pool references provider '{}' with no credentials", entry.provider)
        })?;
        let manager = build_pool(&config, entry, credentials, store.clone())?;
        tracing::info!(pool = %manager.pool_name(), "Pool configured");
        pools.insert(manager.pool_name().to_string(), manager);
    }
    anyhow::ensure!(!pools.is_empty(), "No pools configured");

    for manager in pools.values() {
        manager.start_background_jobs();
    }

    let state = AppState {
        pools: Arc::new(pools),
        store,
        assign_timeout_secs: config.assign_timeout_secs,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "HTTP API listening");

    let pools = state.pools.clone();
    axum::serve(listener, app::build_http_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for manager in pools.values() {
        manager.shutdown().await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_pool(
    config: &ServerConfig,
    entry: &PoolEntry,
    credentials: &ProviderCredentials,
    store: Arc<VmStore>,
) -> anyhow::Result<Arc<PoolManager>> {
    let pool_config = PoolConfig {
        region: entry.region.clone(),
        large: entry.large,
        min_size: entry.min_size,
        limit_size: entry.limit_size,
        min_uptime_minutes: entry.min_uptime_minutes,
        tag_prefix: config.tag.clone(),
        environment: config.environment,
        ramp_down_hours: entry.ramp_down(),
        ramp_up_hours: entry.ramp_up(),
    };

    let account = ProviderAccountConfig {
        token: credentials.token.clone(),
        region: entry.region.clone(),
        location: credentials.location.clone(),
        large: entry.large,
        tag: pool_config.pool_tag(),
        image: credentials.image.clone(),
        ssh_keys: credentials.ssh_keys.clone(),
        network_id: credentials.network_id.clone(),
        host_domain: credentials.host_domain.clone(),
        snapshot_source_vmid: credentials.snapshot_source_vmid.clone(),
        size: credentials.size.clone(),
        large_size: credentials.large_size.clone(),
    };

    let provider: Arc<dyn VmProvider> = Arc::from(build_provider(&entry.provider, account)?);
    Ok(Arc::new(PoolManager::new(pool_config, provider, store)?))
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
