use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use common_redis::{
    ConnectionEvent, ConnectionOptions, ConnectionTarget, Connector, CustomRedisError,
    EventReceiver, RedisConnector,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionState, ProviderEvent};
use crate::error::{ProviderError, StoreError};
use crate::store::{store_identifier, CacheStore, StorePolicy};

const EVENT_CAPACITY: usize = 64;

// A poisoned lock only means another thread panicked mid-update of plain data
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connect to a Redis backend and wait until it is ready.
///
/// `identifier` becomes the namespace root of every store created on the provider.
pub async fn connect(
    identifier: &str,
    host: &str,
    port: u16,
    options: ConnectionOptions,
) -> Result<CacheProvider, ProviderError> {
    connect_with(
        identifier,
        ConnectionTarget::new(host, port, options),
        Arc::new(RedisConnector),
    )
    .await
}

/// Like [`connect`], with an explicit [`Connector`].
pub async fn connect_with(
    identifier: &str,
    target: ConnectionTarget,
    connector: Arc<dyn Connector>,
) -> Result<CacheProvider, ProviderError> {
    let provider = CacheProvider::new(identifier, target, connector);
    provider.connect().await?;
    Ok(provider)
}

/// State shared between the provider, its event pump and (weakly) its stores.
pub(crate) struct ProviderShared {
    identifier: String,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ProviderEvent>,
    connection: RwLock<Option<Arc<ConnectionHandle>>>,
    is_connected: AtomicBool,
    is_ready: AtomicBool,
    closing: AtomicBool,
}

impl ProviderShared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Borrow the live connection for one command.
    pub(crate) fn acquire(&self) -> Result<(Arc<ConnectionHandle>, TaskTrackerToken), StoreError> {
        let connection = read(&self.connection);
        match connection.as_ref() {
            Some(handle) => Ok((handle.clone(), handle.track())),
            None if self.closing.load(Ordering::SeqCst) => Err(StoreError::ProviderClosed),
            None => Err(StoreError::NotConnected),
        }
    }

    fn set_flags(&self, connected: bool, ready: bool) {
        self.is_connected.store(connected, Ordering::SeqCst);
        self.is_ready.store(ready, Ordering::SeqCst);
    }

    fn publish(&self, event: ProviderEvent) {
        if let Err(e) = self.events.send(event) {
            debug!(
                label = %self.identifier,
                event = ?e.0,
                "provider event dropped, nobody is listening"
            );
        }
    }

    fn transition(&self, to: ConnectionState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            if *state == to || *state == ConnectionState::Closed {
                return false;
            }
            from = *state;
            *state = to;
            true
        });

        if changed {
            debug!(label = %self.identifier, %from, %to, "connection state changed");
            self.publish(ProviderEvent::StateChanged { from, to });
        }
    }

    fn apply(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connect => {
                self.is_connected.store(true, Ordering::SeqCst);
                debug!(label = %self.identifier, "cache backend connected");
                self.transition(ConnectionState::Connected);
            }
            ConnectionEvent::Ready => {
                self.set_flags(true, true);
                info!(label = %self.identifier, "cache backend ready");
                self.transition(ConnectionState::Ready);
            }
            ConnectionEvent::Reconnecting {
                delay,
                attempt,
                error,
            } => {
                self.is_ready.store(false, Ordering::SeqCst);
                warn!(
                    label = %self.identifier,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "cache backend reconnecting"
                );
                self.transition(ConnectionState::Reconnecting);
                self.publish(ProviderEvent::Reconnecting {
                    delay,
                    attempt,
                    error,
                });
            }
            ConnectionEvent::Error(error) => {
                self.set_flags(false, false);
                error!(
                    label = %self.identifier,
                    error = %error,
                    retry = ?error.retry_method(),
                    unrecoverable = error.is_unrecoverable_error(),
                    "cache backend error"
                );
                self.publish(ProviderEvent::Error(error));
            }
            ConnectionEvent::End => {
                self.set_flags(false, false);
                info!(label = %self.identifier, "cache backend connection ended");
                if self.closing.load(Ordering::SeqCst) {
                    self.transition(ConnectionState::Closed);
                } else {
                    self.transition(ConnectionState::Disconnected);
                }
            }
        }
    }
}

async fn pump_events(shared: Weak<ProviderShared>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(event);
    }
}

/// Owner of one backend connection and the registry of stores built on it.
///
/// Stores are created with [`create_store`](CacheProvider::create_store) and live as long
/// as the provider's registry. They only reference the connection weakly: once the provider
/// is closed or dropped, their operations fail with [`StoreError::ProviderClosed`].
pub struct CacheProvider {
    identifier: String,
    target: ConnectionTarget,
    connector: Arc<dyn Connector>,
    shared: Arc<ProviderShared>,
    stores: Mutex<HashMap<String, Arc<CacheStore>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CacheProvider {
    pub fn new(identifier: &str, target: ConnectionTarget, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ProviderShared {
            identifier: identifier.to_owned(),
            state: watch::Sender::new(ConnectionState::Disconnected),
            events,
            connection: RwLock::new(None),
            is_connected: AtomicBool::new(false),
            is_ready: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        Self {
            identifier: identifier.to_owned(),
            target,
            connector,
            shared,
            stores: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.target.options
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready.load(Ordering::SeqCst)
    }

    /// Stream of lifecycle notifications. Only events published after the call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events.subscribe()
    }

    /// Watch of the current connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        read(&self.shared.connection).clone()
    }

    /// Open the connection and wait for the backend to become ready.
    ///
    /// Only a disconnected provider can connect. Whichever of "ready" and "error" the
    /// backend signals first decides the outcome. On failure the provider is left
    /// disconnected and holds no connection.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(ProviderError::InvalidState(state));
        }

        // subscribe before opening so the first events cannot be missed
        let mut listener = self.subscribe();
        self.shared.transition(ConnectionState::Connecting);
        info!(
            label = %self.identifier,
            host = %self.target.host,
            port = self.target.port,
            "connecting to cache backend"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let client = match self.connector.open(&self.target, tx) {
            Ok(client) => client,
            Err(e) => {
                error!(label = %self.identifier, error = %e, "cache backend connection failed");
                self.shared.transition(ConnectionState::Disconnected);
                return Err(ProviderError::Connection(e));
            }
        };

        *write(&self.shared.connection) = Some(Arc::new(ConnectionHandle::new(
            client,
            self.target.clone(),
        )));
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.shared), rx));
        if let Some(previous) = lock(&self.pump).replace(pump) {
            previous.abort();
        }

        let outcome = self.wait_until_ready(&mut listener).await;
        if let Err(e) = &outcome {
            error!(label = %self.identifier, error = %e, "cache backend connection failed");
            self.abandon_connection();
        }
        outcome
    }

    async fn wait_until_ready(
        &self,
        listener: &mut broadcast::Receiver<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        loop {
            match listener.recv().await {
                Ok(ProviderEvent::StateChanged {
                    to: ConnectionState::Ready,
                    ..
                }) => return Ok(()),
                Ok(ProviderEvent::StateChanged {
                    to: ConnectionState::Disconnected,
                    ..
                }) => return Err(ProviderError::Connection(CustomRedisError::Closed)),
                Ok(ProviderEvent::StateChanged {
                    to: ConnectionState::Closed,
                    ..
                }) => return Err(ProviderError::Closed),
                Ok(ProviderEvent::Error(e)) => return Err(ProviderError::Connection(e)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(label = %self.identifier, skipped, "provider listener lagged");
                    match self.state() {
                        ConnectionState::Ready => return Ok(()),
                        ConnectionState::Closed => return Err(ProviderError::Closed),
                        _ => continue,
                    }
                }
                Err(RecvError::Closed) => return Err(ProviderError::Closed),
            }
        }
    }

    fn abandon_connection(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        write(&self.shared.connection).take();
        self.shared.set_flags(false, false);
        self.shared.transition(ConnectionState::Disconnected);
    }

    /// Gracefully shut the connection down.
    ///
    /// New store operations fail with [`StoreError::ProviderClosed`] from here on; running
    /// ones are waited for before the backend is asked to quit. Failures are logged and
    /// otherwise ignored: the provider ends up closed either way.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            debug!(label = %self.identifier, "cache provider already closing");
            return;
        }

        let handle = write(&self.shared.connection).take();
        if let Some(handle) = handle {
            let in_flight = handle.in_flight();
            if in_flight > 0 {
                debug!(label = %self.identifier, in_flight, "waiting for in-flight commands");
            }
            handle.drain().await;

            match handle.client().quit().await {
                Ok(()) => info!(label = %self.identifier, "cache backend connection closed"),
                Err(e) => error!(
                    label = %self.identifier,
                    error = %e,
                    "failed to close cache backend connection"
                ),
            }
        }

        self.shared.set_flags(false, false);
        self.shared.transition(ConnectionState::Closed);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    /// Create the store `name`, or return the existing one.
    ///
    /// First writer wins: when a store with this name already exists it is returned as-is
    /// and `policy` is ignored.
    pub fn create_store(
        &self,
        name: &str,
        policy: Option<StorePolicy>,
    ) -> Result<Arc<CacheStore>, ProviderError> {
        if name.is_empty() {
            return Err(ProviderError::EmptyStoreName);
        }
        if self.state() == ConnectionState::Closed {
            return Err(ProviderError::Closed);
        }

        let identifier = store_identifier(&self.identifier, name);
        let mut stores = lock(&self.stores);
        if let Some(store) = stores.get(&identifier) {
            if policy.is_some_and(|p| p != store.policy()) {
                debug!(label = %identifier, "store exists, ignoring the new policy");
            }
            return Ok(store.clone());
        }

        let policy = policy.unwrap_or_default();
        if !policy.is_valid() {
            return Err(ProviderError::InvalidPolicy);
        }

        let store = Arc::new(CacheStore::new(
            name,
            identifier.clone(),
            policy,
            Arc::downgrade(&self.shared),
        ));
        stores.insert(identifier, store.clone());
        info!(label = %store.identifier(), expire = policy.expire, "created cache store");

        Ok(store)
    }

    /// Look up a store created earlier.
    pub fn store(&self, name: &str) -> Option<Arc<CacheStore>> {
        lock(&self.stores)
            .get(&store_identifier(&self.identifier, name))
            .cloned()
    }

    /// Names of every registered store, sorted.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.stores)
            .values()
            .map(|store| store.name().to_owned())
            .collect();
        names.sort();
        names
    }
}

impl Drop for CacheProvider {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}
