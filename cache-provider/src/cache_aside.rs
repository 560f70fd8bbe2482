//! Read-through helpers on top of a [`CacheStore`].
//!
//! On a miss the caller's source function produces the value, which is written back into
//! the store before it is returned. Absent source results, including values that serialize
//! to JSON `null`, are never cached.

use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CacheAsideError, StoreError};
use crate::store::CacheStore;

const LOOKUPS_TOTAL: &str = "cache_aside_lookups_total";

/// Where a cache-aside lookup got its answer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from the store.
    Cache,
    /// Not cached, produced by the source and written back.
    SourceCacheMiss,
    /// The cached entry could not be read, produced by the source and written over it.
    SourceCacheCorrupted,
    /// Not cached and the source had nothing either.
    SourceNotFound,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::Cache => write!(f, "cache"),
            CacheSource::SourceCacheMiss => write!(f, "source_cache_miss"),
            CacheSource::SourceCacheCorrupted => write!(f, "source_cache_corrupted"),
            CacheSource::SourceNotFound => write!(f, "source_not_found"),
        }
    }
}

/// A lookup result together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<V> {
    pub value: Option<V>,
    pub source: CacheSource,
}

impl<V> CacheResult<V> {
    pub fn found(value: V, source: CacheSource) -> Self {
        Self {
            value: Some(value),
            source,
        }
    }

    pub fn not_found(source: CacheSource) -> Self {
        Self {
            value: None,
            source,
        }
    }

    pub fn was_cached(&self) -> bool {
        self.source == CacheSource::Cache
    }

    pub fn invoked_source(&self) -> bool {
        !self.was_cached()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

/// Return the cached value of `key`, or produce it with `source` and cache it.
///
/// Concurrent misses on the same key each run `source`. Use
/// [`get_from_cache_or_source_coalesced`] when that is too expensive.
pub async fn get_from_cache_or_source<V, E, F, Fut>(
    store: &CacheStore,
    key: &str,
    source: F,
) -> Result<CacheResult<V>, CacheAsideError<E>>
where
    V: Serialize + DeserializeOwned,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
{
    let result = lookup(store, key, source).await?;
    metrics::counter!(LOOKUPS_TOTAL, "source" => result.source.to_string()).increment(1);
    debug!(label = %store.identifier(), key, source = %result.source, "cache-aside lookup");
    Ok(result)
}

/// Like [`get_from_cache_or_source`], but concurrent callers for the same key of the same
/// store take turns: the first runs `source`, the others then find its value in the cache.
///
/// Absent results are not shared, so when `source` finds nothing the next caller runs it
/// again.
pub async fn get_from_cache_or_source_coalesced<V, E, F, Fut>(
    store: &CacheStore,
    key: &str,
    source: F,
) -> Result<CacheResult<V>, CacheAsideError<E>>
where
    V: Serialize + DeserializeOwned,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
{
    let _claim = store.claim(key).await;
    get_from_cache_or_source(store, key, source).await
}

async fn lookup<V, E, F, Fut>(
    store: &CacheStore,
    key: &str,
    source: F,
) -> Result<CacheResult<V>, CacheAsideError<E>>
where
    V: Serialize + DeserializeOwned,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
{
    let mut corrupted = false;
    if store.exists(key).await? {
        match store.get(key).await {
            Ok(Some(value)) => return Ok(CacheResult::found(value, CacheSource::Cache)),
            // expired between the two commands
            Ok(None) => {}
            Err(StoreError::Serialization { source: e, .. }) => {
                warn!(
                    label = %store.identifier(),
                    key,
                    error = %e,
                    "cached value is corrupted, refreshing from source"
                );
                corrupted = true;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // a value that serializes to JSON null reads back as a miss, so it is never written
    let produced = source(key.to_owned())
        .await
        .map_err(CacheAsideError::Source)?
        .filter(|value| !serializes_to_null(value));

    match produced {
        Some(value) => {
            store.set(key, &value).await?;
            let source = if corrupted {
                CacheSource::SourceCacheCorrupted
            } else {
                CacheSource::SourceCacheMiss
            };
            Ok(CacheResult::found(value, source))
        }
        None => {
            if corrupted {
                store.remove(key).await?;
            }
            Ok(CacheResult::not_found(CacheSource::SourceNotFound))
        }
    }
}

fn serializes_to_null<V: Serialize>(value: &V) -> bool {
    serde_json::to_value(value).is_ok_and(|v| v.is_null())
}
