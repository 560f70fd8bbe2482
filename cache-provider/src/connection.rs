use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common_redis::{Client, ConnectionTarget, CustomRedisError};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

/// Connection state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The socket is up but the backend has not confirmed it can serve yet.
    Connected,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notifications published by a provider, see [`CacheProvider::subscribe`](crate::CacheProvider::subscribe).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The backend lost the connection and is retrying. Commands issued now are queued by
    /// the backend client.
    Reconnecting {
        delay: Duration,
        attempt: u32,
        error: CustomRedisError,
    },
    /// The backend reported an error. Not a state: the provider only drops its
    /// connected/ready flags and leaves retrying to the backend client.
    Error(CustomRedisError),
}

/// The one physical connection a provider owns.
///
/// Stores reach it through the provider and hold it only for the duration of a command.
/// Every command holds a tracker token so shutdown can wait for in-flight work.
pub struct ConnectionHandle {
    target: ConnectionTarget,
    client: Arc<dyn Client>,
    tracker: TaskTracker,
}

impl ConnectionHandle {
    pub(crate) fn new(client: Arc<dyn Client>, target: ConnectionTarget) -> Self {
        Self {
            target,
            client,
            tracker: TaskTracker::new(),
        }
    }

    pub fn client(&self) -> &dyn Client {
        self.client.as_ref()
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    /// Number of commands currently running on this connection.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub(crate) fn track(&self) -> TaskTrackerToken {
        self.tracker.token()
    }

    /// Stop accepting tracked work and wait for what is already running.
    pub(crate) async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
