use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use common_redis::{escape_pattern, CustomRedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error};

use crate::connection::ConnectionHandle;
use crate::error::StoreError;
use crate::provider::ProviderShared;

pub const DEFAULT_EXPIRE_SECONDS: u64 = 3600;

/// Longest expiry accepted for a store.
///
/// Redis keeps absolute expiry times as signed milliseconds since the epoch and refuses
/// `SET EX` values that overflow them. Half of that range leaves room for the current time.
pub const MAX_EXPIRE_SECONDS: u64 = i64::MAX as u64 / 1000 / 2;

const COMMANDS_TOTAL: &str = "cache_store_commands_total";
const ERRORS_TOTAL: &str = "cache_store_errors_total";

/// `urn:<provider>:<store>`
pub(crate) fn store_identifier(provider: &str, name: &str) -> String {
    format!("urn:{provider}:{name}")
}

/// Expiry applied to every write of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// Seconds until a written entry expires. Reset on every write.
    pub expire: u64,
}

impl StorePolicy {
    pub fn with_expire(expire: u64) -> Self {
        Self { expire }
    }

    /// Whether the backend can honor this expiry.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_EXPIRE_SECONDS).contains(&self.expire)
    }
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self::with_expire(DEFAULT_EXPIRE_SECONDS)
    }
}

type FlightRegistry = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

fn lock(registry: &FlightRegistry) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive claim on one key of a store, see [`CacheStore::claim`].
pub(crate) struct FlightGuard<'a> {
    registry: &'a FlightRegistry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // an entry only the registry still references has no holder and no waiter,
        // including entries left behind by waiters that gave up
        lock(self.registry).retain(|_, flight| Arc::strong_count(flight) > 1);
    }
}

/// A named container of entries sharing one expiry policy.
///
/// Every key is stored as `<identifier>:<key>`, so stores of one provider never see each
/// other's entries. Values are stored as JSON.
pub struct CacheStore {
    name: String,
    identifier: String,
    policy: StorePolicy,
    provider: Weak<ProviderShared>,
    in_flight: FlightRegistry,
}

impl CacheStore {
    pub(crate) fn new(
        name: &str,
        identifier: String,
        policy: StorePolicy,
        provider: Weak<ProviderShared>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            identifier,
            policy,
            provider,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    /// The physical key of `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}:{}", self.identifier, key)
    }

    fn acquire(&self) -> Result<(Arc<ConnectionHandle>, TaskTrackerToken), StoreError> {
        let provider = self.provider.upgrade().ok_or(StoreError::ProviderClosed)?;
        provider.acquire().inspect_err(|e| {
            debug!(label = %self.identifier, error = %e, "store has no connection");
        })
    }

    fn command(&self, op: &'static str) {
        metrics::counter!(COMMANDS_TOTAL, "op" => op).increment(1);
    }

    fn failed(&self, op: &'static str, source: CustomRedisError) -> StoreError {
        let retry = source.retry_method();
        let err = StoreError::Backend { op, source };
        error!(
            label = %self.identifier,
            op,
            error = %err,
            retry = ?retry,
            retryable = err.is_retryable(),
            "cache store command failed"
        );
        metrics::counter!(ERRORS_TOTAL, "op" => op, "retryable" => err.is_retryable().to_string())
            .increment(1);
        err
    }

    fn serialize<V: Serialize>(&self, key: &str, value: &V) -> Result<String, StoreError> {
        serde_json::to_string(value).map_err(|source| {
            error!(label = %self.identifier, key, error = %source, "could not serialize value");
            StoreError::Serialization {
                key: key.to_owned(),
                source,
            }
        })
    }

    fn deserialize<V: DeserializeOwned>(&self, key: &str, raw: &str) -> Result<V, StoreError> {
        serde_json::from_str(raw).map_err(|source| {
            error!(label = %self.identifier, key, error = %source, "could not deserialize value");
            StoreError::Serialization {
                key: key.to_owned(),
                source,
            }
        })
    }

    /// Write `value` under `key`, (re)starting its expiry. Returns the backend acknowledgement.
    pub async fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<String, StoreError> {
        let key = self.key(key);
        let value = self.serialize(&key, value)?;
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, key, expire = self.policy.expire, "set");
        self.command("set");
        connection
            .client()
            .setex(key, value, self.policy.expire)
            .await
            .map_err(|e| self.failed("set", e))
    }

    /// Write all `entries` in one atomic batch, each with the store expiry.
    ///
    /// Returns the number of entries written. An empty batch never reaches the backend.
    pub async fn set_many<K, V>(&self, entries: &[(K, V)]) -> Result<usize, StoreError>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        if entries.is_empty() {
            return Ok(0);
        }

        let items = entries
            .iter()
            .map(|(key, value)| {
                let key = self.key(key.as_ref());
                let value = self.serialize(&key, value)?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let (connection, _token) = self.acquire()?;

        let count = items.len();
        debug!(label = %self.identifier, count, expire = self.policy.expire, "set_many");
        self.command("set_many");
        connection
            .client()
            .mset(items, Some(self.policy.expire))
            .await
            .map_err(|e| self.failed("set_many", e))?;

        Ok(count)
    }

    /// The value under `key`, `None` when there is none.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, StoreError> {
        let key = self.key(key);
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, key, "get");
        self.command("get");
        let raw = match connection.client().get(key.clone()).await {
            Ok(raw) => raw,
            Err(CustomRedisError::NotFound) => return Ok(None),
            Err(e) => return Err(self.failed("get", e)),
        };

        self.deserialize(&key, &raw).map(Some)
    }

    /// Values for `keys`, in request order, `None` where a key has no value.
    pub async fn get_many<K, V>(&self, keys: &[K]) -> Result<Vec<Option<V>>, StoreError>
    where
        K: AsRef<str>,
        V: DeserializeOwned,
    {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let keys: Vec<String> = keys.iter().map(|key| self.key(key.as_ref())).collect();
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, count = keys.len(), "get_many");
        self.command("get_many");
        let values = connection
            .client()
            .mget(keys.clone())
            .await
            .map_err(|e| self.failed("get_many", e))?;

        keys.iter()
            .zip(values)
            .map(|(key, raw)| match raw {
                Some(raw) => self.deserialize(key, &raw).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, key, "exists");
        self.command("exists");
        let count = connection
            .client()
            .exists(key)
            .await
            .map_err(|e| self.failed("exists", e))?;

        Ok(count > 0)
    }

    /// Delete `key`. Returns how many entries were removed.
    pub async fn remove(&self, key: &str) -> Result<u64, StoreError> {
        let key = self.key(key);
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, key, "remove");
        self.command("remove");
        connection
            .client()
            .del(key)
            .await
            .map_err(|e| self.failed("remove", e))
    }

    /// Delete all `keys` in one command. An empty list never reaches the backend.
    pub async fn remove_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = keys.iter().map(|key| self.key(key.as_ref())).collect();
        let (connection, _token) = self.acquire()?;

        debug!(label = %self.identifier, count = keys.len(), "remove_many");
        self.command("remove_many");
        connection
            .client()
            .batch_del(keys)
            .await
            .map_err(|e| self.failed("remove_many", e))
    }

    /// Physical keys of every entry in the store, prefix included.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let (connection, _token) = self.acquire()?;
        self.scan(&connection, "keys").await
    }

    async fn scan(
        &self,
        connection: &ConnectionHandle,
        op: &'static str,
    ) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}:*", escape_pattern(&self.identifier));

        debug!(label = %self.identifier, pattern, "{op}");
        self.command(op);
        connection
            .client()
            .keys(pattern)
            .await
            .map_err(|e| self.failed(op, e))
    }

    /// Delete every entry of the store. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let (connection, _token) = self.acquire()?;

        let keys = self.scan(&connection, "clear").await?;
        if keys.is_empty() {
            return Ok(0);
        }

        debug!(label = %self.identifier, count = keys.len(), "clear");
        connection
            .client()
            .batch_del(keys)
            .await
            .map_err(|e| self.failed("clear", e))
    }

    /// Wait for exclusive use of `key` among callers of this store.
    pub(crate) async fn claim(&self, key: &str) -> FlightGuard<'_> {
        let flight = lock(&self.in_flight)
            .entry(key.to_owned())
            .or_default()
            .clone();

        // built before waiting so that a cancelled wait still cleans up
        let mut claim = FlightGuard {
            registry: &self.in_flight,
            guard: None,
        };
        claim.guard = Some(flight.lock_owned().await);
        claim
    }

    #[cfg(test)]
    pub(crate) fn claims(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("identifier", &self.identifier)
            .field("policy", &self.policy)
            .finish()
    }
}
