use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_provider::{
    get_from_cache_or_source, get_from_cache_or_source_coalesced, CacheAsideError, CacheSource,
    StoreError,
};
use common_redis::CustomRedisError;
use serde_json::{json, Value};
use tokio::sync::Barrier;

mod common;
use common::ready_provider;

#[derive(Debug, PartialEq)]
struct SourceDown;

#[tokio::test]
async fn test_miss_populates_the_store() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();

    let result = get_from_cache_or_source(&store, "k", |key| async move {
        assert_eq!(key, "k");
        Ok::<_, Infallible>(Some("value-1".to_string()))
    })
    .await
    .unwrap();

    assert_eq!(result.value.as_deref(), Some("value-1"));
    assert_eq!(result.source, CacheSource::SourceCacheMiss);
    assert_eq!(
        store.get::<String>("k").await.unwrap().as_deref(),
        Some("value-1")
    );
}

#[tokio::test]
async fn test_hit_does_not_call_the_source() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    store.set("k", &json!({"name": "cached"})).await.unwrap();

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Err::<Option<Value>, _>(SourceDown)
    })
    .await
    .unwrap();

    assert!(result.was_cached());
    assert_eq!(result.value, Some(json!({"name": "cached"})));
}

#[tokio::test]
async fn test_absent_source_result_is_not_cached() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<Option<String>, Infallible>(None)
    })
    .await
    .unwrap();

    assert_eq!(result.value, None);
    assert_eq!(result.source, CacheSource::SourceNotFound);
    assert!(!store.exists("k").await.unwrap());
    assert_eq!(connector.client().calls_for("setex"), 0);
}

#[tokio::test]
async fn test_null_source_result_is_not_cached() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();

    let first = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some(Value::Null))
    })
    .await
    .unwrap();
    let second = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some(json!("fresh")))
    })
    .await
    .unwrap();

    assert_eq!(first.value, None);
    assert_eq!(first.source, CacheSource::SourceNotFound);
    assert_eq!(second.source, CacheSource::SourceCacheMiss);
    assert_eq!(second.value, Some(json!("fresh")));
    assert_eq!(connector.client().calls_for("setex"), 1);
}

#[tokio::test]
async fn test_null_source_result_drops_a_corrupted_entry() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let mut client = connector.client();
    client.insert_raw("urn:app:users:k", "{truncated");

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some(Value::Null))
    })
    .await
    .unwrap();

    assert_eq!(result.source, CacheSource::SourceNotFound);
    assert!(client.raw_value("urn:app:users:k").is_none());
    assert_eq!(client.calls_for("setex"), 0);
}

#[tokio::test]
async fn test_source_errors_are_returned() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Err::<Option<String>, _>(SourceDown)
    })
    .await;

    assert!(matches!(result, Err(CacheAsideError::Source(SourceDown))));
    assert!(!store.exists("k").await.unwrap());
}

#[tokio::test]
async fn test_store_errors_are_returned() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let mut client = connector.client();
    client.fail_op("exists", CustomRedisError::Timeout);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let result = get_from_cache_or_source(&store, "k", move |_| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(Some(1))
    })
    .await;

    assert!(matches!(
        result,
        Err(CacheAsideError::Store(StoreError::Backend { op: "exists", .. }))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corrupted_entry_is_refreshed_from_source() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let mut client = connector.client();
    client.insert_raw("urn:app:users:k", "{truncated");

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<_, Infallible>(Some(json!({"fresh": true})))
    })
    .await
    .unwrap();

    assert_eq!(result.source, CacheSource::SourceCacheCorrupted);
    assert_eq!(
        client.raw_value("urn:app:users:k").as_deref(),
        Some(r#"{"fresh":true}"#)
    );
}

#[tokio::test]
async fn test_corrupted_entry_is_dropped_when_source_has_nothing() {
    let (provider, connector) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let mut client = connector.client();
    client.insert_raw("urn:app:users:k", "{truncated");

    let result = get_from_cache_or_source(&store, "k", |_| async {
        Ok::<Option<Value>, Infallible>(None)
    })
    .await
    .unwrap();

    assert_eq!(result.source, CacheSource::SourceNotFound);
    assert!(client.raw_value("urn:app:users:k").is_none());
}

#[tokio::test]
async fn test_concurrent_misses_each_run_the_source() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    // both lookups must be inside the source at the same time
    let barrier = Arc::new(Barrier::new(2));

    let source = |_key: String| {
        let calls = calls.clone();
        let barrier = barrier.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            barrier.wait().await;
            Ok::<_, Infallible>(Some("value-1".to_string()))
        }
    };

    let (first, second) = tokio::time::timeout(Duration::from_secs(1), async {
        tokio::join!(
            get_from_cache_or_source(&store, "k", source),
            get_from_cache_or_source(&store, "k", source),
        )
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.unwrap().source, CacheSource::SourceCacheMiss);
    assert_eq!(second.unwrap().source, CacheSource::SourceCacheMiss);
}

#[tokio::test]
async fn test_coalesced_misses_run_the_source_once() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let source = |_key: String| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Infallible>(Some("value-1".to_string()))
        }
    };

    let lookups: Vec<_> = (0..4)
        .map(|_| get_from_cache_or_source_coalesced(&store, "k", source))
        .collect();
    let results = futures::future::join_all(lookups).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let sources: Vec<CacheSource> = results.into_iter().map(|r| r.unwrap().source).collect();
    assert_eq!(sources.iter().filter(|s| **s == CacheSource::Cache).count(), 3);
    assert!(sources.contains(&CacheSource::SourceCacheMiss));
}

#[tokio::test]
async fn test_coalesced_absent_results_are_not_shared() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let source = |_key: String| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<String>, Infallible>(None)
        }
    };

    let (first, second) = tokio::join!(
        get_from_cache_or_source_coalesced(&store, "k", source),
        get_from_cache_or_source_coalesced(&store, "k", source),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.unwrap().value, None);
    assert_eq!(second.unwrap().value, None);
}

#[tokio::test]
async fn test_coalescing_is_per_key() {
    let (provider, _) = ready_provider().await;
    let store = provider.create_store("users", None).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let source = |key: String| {
        let barrier = barrier.clone();
        async move {
            // deadlocks unless both keys are loaded at once
            barrier.wait().await;
            Ok::<_, Infallible>(Some(key))
        }
    };

    let (a, b) = tokio::time::timeout(Duration::from_secs(1), async {
        tokio::join!(
            get_from_cache_or_source_coalesced(&store, "a", source),
            get_from_cache_or_source_coalesced(&store, "b", source),
        )
    })
    .await
    .unwrap();

    assert_eq!(a.unwrap().value.as_deref(), Some("a"));
    assert_eq!(b.unwrap().value.as_deref(), Some("b"));
}
