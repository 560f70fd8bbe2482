//! Runs against a real Redis, configured through the usual `REDIS_*` variables.
use cache_provider::config::RedisConfig;
use cache_provider::{
    connect_with, get_from_cache_or_source, CacheSource, ConnectionState, StorePolicy,
};
use common_redis::RedisConnector;
use envconfig::Envconfig;
use std::convert::Infallible;
use std::sync::Arc;

async fn live_provider() -> cache_provider::CacheProvider {
    let config = RedisConfig::init_from_env().expect("invalid redis configuration");
    let identifier = format!("cache-provider-test-{}", uuid::Uuid::now_v7());

    connect_with(&identifier, config.target(), Arc::new(RedisConnector))
        .await
        .expect("redis should be reachable")
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_store_round_trip() {
    let provider = live_provider().await;
    assert_eq!(provider.state(), ConnectionState::Ready);
    let store = provider
        .create_store("users", Some(StorePolicy::with_expire(60)))
        .unwrap();

    assert_eq!(store.set("a", &1).await.unwrap(), "OK");
    assert_eq!(store.set_many(&[("b", 2), ("c", 3)]).await.unwrap(), 2);
    let values: Vec<Option<u32>> = store.get_many(&["a", "b", "missing", "c"]).await.unwrap();
    assert_eq!(values, vec![Some(1), Some(2), None, Some(3)]);
    assert!(store.exists("b").await.unwrap());
    assert_eq!(store.keys().await.unwrap().len(), 3);

    assert_eq!(store.clear().await.unwrap(), 3);
    assert!(store.keys().await.unwrap().is_empty());

    provider.close().await;
    assert_eq!(provider.state(), ConnectionState::Closed);
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn test_cache_aside_round_trip() {
    let provider = live_provider().await;
    let store = provider.create_store("aside", None).unwrap();

    let miss = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some("value-1".to_string()))
    })
    .await
    .unwrap();
    let hit = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some("other".to_string()))
    })
    .await
    .unwrap();

    assert_eq!(miss.source, CacheSource::SourceCacheMiss);
    assert_eq!(hit.source, CacheSource::Cache);
    assert_eq!(hit.value.as_deref(), Some("value-1"));

    store.clear().await.unwrap();
    provider.close().await;
}
