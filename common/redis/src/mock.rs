use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{
    Client, ConnectionEvent, ConnectionTarget, Connector, CustomRedisError, EventSender,
};

#[derive(Debug, Clone)]
struct MockEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory stand-in for a Redis server.
///
/// Clones share the same data, so a test can keep one handle for assertions while the code
/// under test owns another. Every command is recorded and can be inspected with
/// [`get_calls`](MockRedisClient::get_calls). Failures are injected per command name.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, MockEntry>>>,
    failures: Arc<Mutex<HashMap<String, CustomRedisError>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
    VecString(Vec<String>),
    Pairs(Vec<(String, String)>, Option<u64>),
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

// Poisoning only happens if a test already panicked, keep going with the data
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `op` command fail with `err`.
    pub fn fail_op(&mut self, op: &str, err: CustomRedisError) -> Self {
        lock(&self.failures).insert(op.to_owned(), err);
        self.clone()
    }

    pub fn clear_failures(&mut self) -> Self {
        lock(&self.failures).clear();
        self.clone()
    }

    /// Store a raw value without recording a call, e.g. to plant malformed data.
    pub fn insert_raw(&mut self, key: &str, value: &str) -> Self {
        lock(&self.entries).insert(
            key.to_owned(),
            MockEntry {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        self.clone()
    }

    /// Raw stored value, ignoring expiry bookkeeping.
    pub fn raw_value(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).map(|e| e.value.clone())
    }

    /// Remaining time to live in whole seconds, `None` for missing or persistent keys.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        lock(&self.entries)
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now).as_secs_f64().round() as u64)
    }

    pub fn stored_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = lock(&self.entries)
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, op: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.op == op).count()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, op: &str, key: String, value: MockRedisValue) -> Result<(), CustomRedisError> {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key,
            value,
        });

        match lock(&self.failures).get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(&self, key: String, value: String, ttl_seconds: Option<u64>) {
        // a deadline past what Instant can hold never arrives
        let expires_at =
            ttl_seconds.and_then(|ttl| Instant::now().checked_add(Duration::from_secs(ttl)));
        lock(&self.entries).insert(key, MockEntry { value, expires_at });
    }

    fn remove(&self, key: &str) -> u64 {
        let now = Instant::now();
        match lock(&self.entries).remove(key) {
            Some(entry) if entry.is_live(now) => 1,
            _ => 0,
        }
    }
}

/// Glob matching as KEYS does it, for the subset the cache layer emits: `*`, `?` and
/// backslash escapes.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    glob_match_from(&pattern, &key)
}

fn glob_match_from(pattern: &[char], key: &[char]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some('*') => (0..=key.len()).any(|skip| glob_match_from(&pattern[1..], &key[skip..])),
        Some('?') => !key.is_empty() && glob_match_from(&pattern[1..], &key[1..]),
        Some('\\') if pattern.len() > 1 => {
            key.first() == Some(&pattern[1]) && glob_match_from(&pattern[2..], &key[1..])
        }
        Some(c) => key.first() == Some(c) && glob_match_from(&pattern[1..], &key[1..]),
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn ping(&self) -> Result<String, CustomRedisError> {
        self.record("ping", String::new(), MockRedisValue::None)?;
        Ok("PONG".to_string())
    }

    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", key.clone(), MockRedisValue::None)?;
        self.live_value(&key).ok_or(CustomRedisError::NotFound)
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        self.record(
            "mget",
            format!("keys={}", keys.len()),
            MockRedisValue::VecString(keys.clone()),
        )?;
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn setex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<String, CustomRedisError> {
        self.record(
            "setex",
            key.clone(),
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        )?;
        self.write(key, value, Some(seconds));
        Ok("OK".to_string())
    }

    async fn mset(
        &self,
        items: Vec<(String, String)>,
        ttl_seconds: Option<u64>,
    ) -> Result<String, CustomRedisError> {
        self.record(
            "mset",
            format!("items={}", items.len()),
            MockRedisValue::Pairs(items.clone(), ttl_seconds),
        )?;
        for (k, v) in items {
            self.write(k, v, ttl_seconds);
        }
        Ok("OK".to_string())
    }

    async fn exists(&self, key: String) -> Result<u64, CustomRedisError> {
        self.record("exists", key.clone(), MockRedisValue::None)?;
        Ok(u64::from(self.live_value(&key).is_some()))
    }

    async fn del(&self, key: String) -> Result<u64, CustomRedisError> {
        self.record("del", key.clone(), MockRedisValue::None)?;
        Ok(self.remove(&key))
    }

    async fn batch_del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        self.record(
            "batch_del",
            format!("keys={}", keys.len()),
            MockRedisValue::VecString(keys.clone()),
        )?;
        Ok(keys.iter().map(|k| self.remove(k)).sum())
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("keys", pattern.clone(), MockRedisValue::String(pattern.clone()))?;
        Ok(self
            .stored_keys()
            .into_iter()
            .filter(|k| glob_match(&pattern, k))
            .collect())
    }

    async fn quit(&self) -> Result<(), CustomRedisError> {
        self.record("quit", String::new(), MockRedisValue::None)
    }
}

/// How a [`MockConnector`] reacts to `open`.
#[derive(Debug, Clone)]
pub enum MockConnectScript {
    /// Emit `Connect` then `Ready`.
    Ready,
    /// Emit `Connect` only; the test drives the rest with [`MockConnector::emit`].
    ConnectOnly,
    /// Emit `Error` then `End`, as a refused connection does.
    Fail(CustomRedisError),
    /// Refuse synchronously, as invalid configuration does.
    Reject(CustomRedisError),
    /// Emit nothing.
    Silent,
}

/// [`Connector`] handing out a shared [`MockRedisClient`] and scripted lifecycle events.
#[derive(Clone)]
pub struct MockConnector {
    client: MockRedisClient,
    script: MockConnectScript,
    opened: Arc<AtomicUsize>,
    events: Arc<Mutex<Option<EventSender>>>,
}

impl MockConnector {
    pub fn new(client: MockRedisClient, script: MockConnectScript) -> Self {
        Self {
            client,
            script,
            opened: Arc::new(AtomicUsize::new(0)),
            events: Arc::new(Mutex::new(None)),
        }
    }

    pub fn ready(client: MockRedisClient) -> Self {
        Self::new(client, MockConnectScript::Ready)
    }

    pub fn client(&self) -> MockRedisClient {
        self.client.clone()
    }

    /// How many connections were opened through this connector.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Push a lifecycle event on the most recently opened connection. Returns false when
    /// nothing is listening.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        _target: &ConnectionTarget,
        events: EventSender,
    ) -> Result<Arc<dyn Client>, CustomRedisError> {
        if let MockConnectScript::Reject(err) = &self.script {
            return Err(err.clone());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let scripted = match &self.script {
            MockConnectScript::Ready => vec![ConnectionEvent::Connect, ConnectionEvent::Ready],
            MockConnectScript::ConnectOnly => vec![ConnectionEvent::Connect],
            MockConnectScript::Fail(err) => {
                vec![ConnectionEvent::Error(err.clone()), ConnectionEvent::End]
            }
            MockConnectScript::Reject(_) | MockConnectScript::Silent => vec![],
        };
        for event in scripted {
            if events.send(event).is_err() {
                break;
            }
        }

        *lock(&self.events) = Some(events);
        Ok(Arc::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("urn:a:b:*", "urn:a:b:key"));
        assert!(glob_match("urn:a:b:*", "urn:a:b:"));
        assert!(!glob_match("urn:a:b:*", "urn:a:bb:key"));
        assert!(glob_match("k?y", "key"));
        assert!(!glob_match("k?y", "ky"));
        assert!(glob_match("urn:a\\*:*", "urn:a*:x"));
        assert!(!glob_match("urn:a\\*:*", "urn:ab:x"));
    }

    #[tokio::test]
    async fn test_mock_set_get_del() {
        let client = MockRedisClient::new();

        client
            .setex("k".to_string(), "v".to_string(), 60)
            .await
            .unwrap();
        assert_eq!(client.get("k".to_string()).await.unwrap(), "v");
        assert_eq!(client.ttl("k"), Some(60));
        assert_eq!(client.exists("k".to_string()).await.unwrap(), 1);
        assert_eq!(client.del("k".to_string()).await.unwrap(), 1);
        assert!(matches!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::NotFound)
        ));

        let ops: Vec<String> = client.get_calls().into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec!["setex", "get", "exists", "del", "get"]);
    }

    #[tokio::test]
    async fn test_mock_expired_entries_are_gone() {
        let client = MockRedisClient::new();

        client
            .setex("k".to_string(), "v".to_string(), 0)
            .await
            .unwrap();

        assert_eq!(client.exists("k".to_string()).await.unwrap(), 0);
        assert!(client.keys("*".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_huge_ttl_does_not_overflow() {
        let client = MockRedisClient::new();

        client
            .setex("k".to_string(), "v".to_string(), u64::MAX)
            .await
            .unwrap();
        client
            .mset(vec![("m".to_string(), "1".to_string())], Some(u64::MAX))
            .await
            .unwrap();

        assert_eq!(client.get("k".to_string()).await.unwrap(), "v");
        assert_eq!(client.exists("m".to_string()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mock_injected_failure() {
        let mut client = MockRedisClient::new();
        client.fail_op("get", CustomRedisError::Timeout);

        assert!(matches!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::Timeout)
        ));
        // the call is still recorded
        assert_eq!(client.calls_for("get"), 1);

        client.clear_failures();
        assert!(matches!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_connector_scripts() {
        let connector = MockConnector::ready(MockRedisClient::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = ConnectionTarget::new("localhost", 6379, Default::default());

        connector.open(&target, tx).unwrap();

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connect)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Ready)));
        assert!(connector.emit(ConnectionEvent::End));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::End)));
        assert_eq!(connector.opened(), 1);

        let rejecting = MockConnector::new(
            MockRedisClient::new(),
            MockConnectScript::Reject(CustomRedisError::InvalidConfiguration("bad".into())),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(rejecting.open(&target, tx).is_err());
        assert_eq!(rejecting.opened(), 0);
    }
}
