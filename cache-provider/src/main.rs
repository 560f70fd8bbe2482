//! Connect to the configured Redis, run one round of store commands and shut down.
use std::sync::Arc;

use anyhow::Context;
use common_redis::RedisConnector;
use envconfig::Envconfig;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache_provider::config::Config;
use cache_provider::connect_with;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let provider = connect_with(
        &config.provider_id,
        config.redis.target(),
        Arc::new(RedisConnector),
    )
    .await
    .context("failed to connect to redis")?;

    let store = provider.create_store(&config.store_name, Some(config.store_policy()))?;
    let probe = json!({ "probe": true, "pid": std::process::id() });

    let ack = store.set("probe", &probe).await?;
    let read: Option<serde_json::Value> = store.get("probe").await?;
    let exists = store.exists("probe").await?;
    let removed = store.remove("probe").await?;

    info!(
        store = %store.identifier(),
        ack,
        round_trip = read.as_ref() == Some(&probe),
        exists,
        removed,
        "probe finished"
    );

    provider.close().await;
    Ok(())
}
