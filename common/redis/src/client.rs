use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    Client, ConnectionEvent, ConnectionTarget, Connector, CustomRedisError, EventSender,
};

// First reconnect delay reported to listeners, doubled per attempt up to the configured max
const BASE_RETRY_DELAY_MILLISECS: u64 = 100;

#[derive(Clone)]
enum Slot {
    Pending,
    Open(ConnectionManager),
    Failed(CustomRedisError),
    Closed,
}

/// Turns command outcomes into reconnect and recovery events.
///
/// A connection loss starts (or continues) a reconnect streak and yields one
/// [`ConnectionEvent::Reconnecting`] per failed command. The first success after a streak
/// yields `Connect` and `Ready` and resets the attempt counter. Other errors are the
/// server rejecting a single command and yield nothing.
struct ReconnectTracker {
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    max_retry_delay: Duration,
}

impl ReconnectTracker {
    fn new(max_retry_delay: Duration) -> Self {
        Self {
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            max_retry_delay,
        }
    }

    fn succeeded(&self) -> Vec<ConnectionEvent> {
        if self.reconnecting.swap(false, Ordering::SeqCst) {
            self.attempts.store(0, Ordering::SeqCst);
            vec![ConnectionEvent::Connect, ConnectionEvent::Ready]
        } else {
            vec![]
        }
    }

    fn failed(&self, err: &CustomRedisError) -> Vec<ConnectionEvent> {
        if !err.is_connection_loss() {
            return vec![];
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.reconnecting.store(true, Ordering::SeqCst);
        warn!(attempt, error = %err, "redis connection lost, reconnecting");
        vec![ConnectionEvent::Reconnecting {
            delay: retry_delay(attempt, self.max_retry_delay),
            attempt,
            error: err.clone(),
        }]
    }
}

fn retry_delay(attempt: u32, max: Duration) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(BASE_RETRY_DELAY_MILLISECS.saturating_mul(factor)).min(max)
}

/// Redis client on top of a [`ConnectionManager`].
///
/// The manager re-establishes dropped connections on its own. This wrapper watches command
/// outcomes to turn those drops into [`ConnectionEvent::Reconnecting`] notifications and
/// reports [`ConnectionEvent::Ready`] again once a command goes through.
pub struct RedisClient {
    slot: Arc<watch::Sender<Slot>>,
    events: EventSender,
    tracker: ReconnectTracker,
}

impl RedisClient {
    /// Start connecting to `target` in the background.
    ///
    /// Returns an error only for configuration problems that make a connection attempt
    /// pointless. Everything else is reported on `events`. Must be called from within a
    /// tokio runtime.
    pub fn open(target: &ConnectionTarget, events: EventSender) -> Result<Self, CustomRedisError> {
        target.options.validate()?;
        let client = redis::Client::open(target.url()?)?;

        let mut config = ConnectionManagerConfig::new()
            .set_number_of_retries(target.options.number_of_retries)
            .set_max_delay(target.options.max_retry_delay.as_millis() as u64);
        if let Some(timeout) = target.options.response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = target.options.connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let slot = Arc::new(watch::Sender::new(Slot::Pending));

        let task_slot = slot.clone();
        let task_events = events.clone();
        tokio::spawn(async move {
            let connected = ConnectionManager::new_with_config(client, config).await;
            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    Self::fail(&task_slot, &task_events, e.into());
                    return;
                }
            };
            Self::emit(&task_events, ConnectionEvent::Connect);

            let pong: Result<String, RedisError> =
                redis::cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => {
                    task_slot.send_replace(Slot::Open(conn));
                    Self::emit(&task_events, ConnectionEvent::Ready);
                }
                Err(e) => Self::fail(&task_slot, &task_events, e.into()),
            }
        });

        Ok(RedisClient {
            slot,
            events,
            tracker: ReconnectTracker::new(target.options.max_retry_delay),
        })
    }

    fn fail(slot: &watch::Sender<Slot>, events: &EventSender, err: CustomRedisError) {
        slot.send_replace(Slot::Failed(err.clone()));
        Self::emit(events, ConnectionEvent::Error(err));
        Self::emit(events, ConnectionEvent::End);
    }

    fn emit(events: &EventSender, event: ConnectionEvent) {
        if let Err(e) = events.send(event) {
            debug!(event = ?e.0, "connection event dropped, nobody is listening");
        }
    }

    /// Wait until the connection is usable. Commands issued while connecting queue here.
    async fn connection(&self) -> Result<ConnectionManager, CustomRedisError> {
        let mut rx = self.slot.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| CustomRedisError::Closed)?;

        match &*slot {
            Slot::Open(conn) => Ok(conn.clone()),
            Slot::Failed(err) => Err(err.clone()),
            Slot::Pending | Slot::Closed => Err(CustomRedisError::Closed),
        }
    }

    /// Map a command result, raising lifecycle events when the connection drops or recovers.
    fn observe<T>(&self, result: Result<T, RedisError>) -> Result<T, CustomRedisError> {
        let (result, events) = match result {
            Ok(value) => (Ok(value), self.tracker.succeeded()),
            Err(e) => {
                let err = CustomRedisError::from(e);
                let events = self.tracker.failed(&err);
                (Err(err), events)
            }
        };
        for event in events {
            Self::emit(&self.events, event);
        }
        result
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn ping(&self) -> Result<String, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("PING").query_async(&mut conn).await;
        self.observe(result)
    }

    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = self.observe(conn.get(k).await)?;

        result.ok_or(CustomRedisError::NotFound)
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connection().await?;
        // explicit MGET: a one element key list must still come back as a list
        let result = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await;
        self.observe(result)
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<String, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await;
        self.observe(result)
    }

    async fn mset(
        &self,
        items: Vec<(String, String)>,
        ttl_seconds: Option<u64>,
    ) -> Result<String, CustomRedisError> {
        if items.is_empty() {
            return Ok("OK".to_string());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mset = pipe.cmd("MSET");
        for (k, v) in &items {
            mset.arg(k).arg(v);
        }
        if let Some(ttl) = ttl_seconds {
            for (k, _) in &items {
                pipe.cmd("EXPIRE").arg(k).arg(ttl).ignore();
            }
        }

        let mut conn = self.connection().await?;
        let result: Result<(String,), RedisError> = pipe.query_async(&mut conn).await;
        self.observe(result).map(|(ack,)| ack)
    }

    async fn exists(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result = conn.exists(k).await;
        self.observe(result)
    }

    async fn del(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result = conn.del(k).await;
        self.observe(result)
    }

    async fn batch_del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let result = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
        self.observe(result)
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection().await?;
        let result = conn.keys(pattern).await;
        self.observe(result)
    }

    async fn quit(&self) -> Result<(), CustomRedisError> {
        let previous = self.slot.send_replace(Slot::Closed);
        let mut conn = match previous {
            Slot::Open(conn) => conn,
            // never connected, nothing to drain
            Slot::Pending | Slot::Failed(_) | Slot::Closed => {
                Self::emit(&self.events, ConnectionEvent::End);
                return Ok(());
            }
        };

        // QUIT is answered after every command already written on the connection
        let result: Result<(), RedisError> = redis::cmd("QUIT").query_async(&mut conn).await;
        Self::emit(&self.events, ConnectionEvent::End);

        match result {
            Ok(()) => Ok(()),
            // the server may hang up before the reply is read
            Err(e) if e.is_connection_dropped() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`Connector`] for real Redis servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

impl Connector for RedisConnector {
    fn open(
        &self,
        target: &ConnectionTarget,
        events: EventSender,
    ) -> Result<Arc<dyn Client>, CustomRedisError> {
        Ok(Arc::new(RedisClient::open(target, events)?))
    }
}
