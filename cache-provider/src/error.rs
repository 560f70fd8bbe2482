use common_redis::CustomRedisError;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors raised while connecting a provider or registering stores on it.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("could not connect to the cache backend: {0}")]
    Connection(#[source] CustomRedisError),
    #[error("cannot connect a provider that is {0}")]
    InvalidState(ConnectionState),
    #[error("the provider is closed")]
    Closed,
    #[error("store name must not be empty")]
    EmptyStoreName,
    #[error("store expiry must be between one second and {max} seconds", max = crate::store::MAX_EXPIRE_SECONDS)]
    InvalidPolicy,
}

/// Errors returned by cache store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache backend command {op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: CustomRedisError,
    },
    #[error("could not (de)serialize the value stored at {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("the provider owning this store is closed")]
    ProviderClosed,
    #[error("the provider owning this store is not connected")]
    NotConnected,
}

impl StoreError {
    /// The backend error behind this failure, if there is one.
    pub fn backend_error(&self) -> Option<&CustomRedisError> {
        match self {
            StoreError::Backend { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True when repeating the operation may succeed, e.g. after a timeout or a dropped
    /// connection. Closed providers and rejected commands are not retryable.
    pub fn is_retryable(&self) -> bool {
        self.backend_error()
            .is_some_and(|source| !source.is_unrecoverable_error())
    }
}

/// Errors from the cache-aside helpers: either the store failed or the source did.
#[derive(Error, Debug)]
pub enum CacheAsideError<E> {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cache source failed: {0}")]
    Source(#[source] E),
}
