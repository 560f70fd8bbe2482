use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use redis::ErrorKind as RedisErrorKind;
pub use redis::RetryMethod;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Timeout error")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Build a backend error of the given kind, mostly for tests and mocks.
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// True when repeating the command cannot succeed: bad configuration, rejected
    /// credentials, a closed client or a missing key.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            CustomRedisError::Timeout => false,
            CustomRedisError::InvalidConfiguration(_)
            | CustomRedisError::NotFound
            | CustomRedisError::Closed => true,
            CustomRedisError::Redis(err) => {
                Self::rejects_client(err) || err.is_unrecoverable_error()
            }
        }
    }

    fn rejects_client(err: &redis::RedisError) -> bool {
        matches!(
            err.kind(),
            redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
        )
    }

    /// How a caller could retry the failed command. Logged with every backend failure.
    pub fn retry_method(&self) -> RetryMethod {
        match self {
            CustomRedisError::Timeout => RetryMethod::WaitAndRetry,
            CustomRedisError::InvalidConfiguration(_)
            | CustomRedisError::NotFound
            | CustomRedisError::Closed => RetryMethod::NoRetry,
            CustomRedisError::Redis(err) if Self::rejects_client(err) => RetryMethod::NoRetry,
            CustomRedisError::Redis(err) => err.retry_method(),
        }
    }

    /// True when the error means the physical connection went away, as opposed to the
    /// server rejecting a single command.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            CustomRedisError::Redis(err) => {
                err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
            }
            _ => false,
        }
    }
}

/// Escape glob metacharacters so that `prefix` matches literally in a KEYS pattern.
pub fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// The command surface the cache layer needs from a key-value backend.
///
/// Values travel as text; callers own (de)serialization. `get` reports a missing key as
/// [`CustomRedisError::NotFound`], while the batch reads report missing keys inline.
#[async_trait]
pub trait Client: Send + Sync {
    async fn ping(&self) -> Result<String, CustomRedisError>;

    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError>;

    /// SET with EX. Returns the server acknowledgement (normally "OK").
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<String, CustomRedisError>;

    /// MSET in a single round trip. With a TTL the write is wrapped in MULTI/EXEC
    /// together with one EXPIRE per key.
    async fn mset(
        &self,
        items: Vec<(String, String)>,
        ttl_seconds: Option<u64>,
    ) -> Result<String, CustomRedisError>;

    async fn exists(&self, k: String) -> Result<u64, CustomRedisError>;
    async fn del(&self, k: String) -> Result<u64, CustomRedisError>;
    async fn batch_del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError>;
    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError>;

    /// Graceful shutdown: previously issued commands are answered first.
    async fn quit(&self) -> Result<(), CustomRedisError>;
}

// Module declarations
mod client;
mod connection;
mod mock;

// Re-export public APIs
pub use client::{RedisClient, RedisConnector};
pub use connection::{
    ConnectionEvent, ConnectionOptions, ConnectionTarget, Connector, EventReceiver, EventSender,
};
pub use mock::{MockConnectScript, MockConnector, MockRedisCall, MockRedisClient, MockRedisValue};
