use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use crate::{Client, CustomRedisError};

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Lifecycle signals raised by a physical connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket is up; commands may still be queued behind the handshake.
    Connect,
    /// The server answered and commands can be served.
    Ready,
    /// The connection was lost and the client is re-establishing it. Commands issued
    /// meanwhile are held by the client, not dropped.
    Reconnecting {
        delay: Duration,
        attempt: u32,
        error: CustomRedisError,
    },
    Error(CustomRedisError),
    /// The connection is gone for good.
    End,
}

/// Backend specific connection options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// Timeout for command responses. `None` means no timeout.
    pub response_timeout: Option<Duration>,
    /// Timeout for establishing the connection. `None` means no timeout.
    pub connection_timeout: Option<Duration>,
    /// How many times the client retries a dropped connection before giving up.
    pub number_of_retries: usize,
    /// Upper bound for the delay between reconnect attempts.
    pub max_retry_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            db: 0,
            username: None,
            password: None,
            tls: false,
            response_timeout: None,
            connection_timeout: None,
            number_of_retries: 6,
            max_retry_delay: Duration::from_millis(2000),
        }
    }
}

impl ConnectionOptions {
    /// Reject settings the client cannot honor. Zero durations are refused: use `None` for
    /// no timeout instead.
    pub fn validate(&self) -> Result<(), CustomRedisError> {
        if self.response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if self.connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if self.db < 0 {
            return Err(CustomRedisError::InvalidConfiguration(format!(
                "Redis database index must not be negative, got {}",
                self.db
            )));
        }
        Ok(())
    }
}

/// Where to connect, plus how.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub options: ConnectionOptions,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, options: ConnectionOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
        }
    }

    /// Connection URL for this target, credentials percent-encoded.
    pub fn url(&self) -> Result<String, CustomRedisError> {
        if self.host.is_empty() {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis host must not be empty".to_string(),
            ));
        }

        let scheme = if self.options.tls { "rediss" } else { "redis" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let mut url = Url::parse(&format!(
            "{scheme}://{host}:{}/{}",
            self.port, self.options.db
        ))
        .map_err(|e| CustomRedisError::InvalidConfiguration(format!("invalid Redis url: {e}")))?;

        if let Some(username) = &self.options.username {
            url.set_username(username).map_err(|_| {
                CustomRedisError::InvalidConfiguration("cannot set Redis username".to_string())
            })?;
        }
        if let Some(password) = &self.options.password {
            url.set_password(Some(password)).map_err(|_| {
                CustomRedisError::InvalidConfiguration("cannot set Redis password".to_string())
            })?;
        }

        Ok(url.into())
    }
}

/// Opens physical connections.
///
/// `open` returns as soon as the client handle exists; the connection itself is
/// established in the background and its progress is reported on `events`. Commands
/// issued before the connection is ready wait for it.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        target: &ConnectionTarget,
        events: EventSender,
    ) -> Result<Arc<dyn Client>, CustomRedisError>;
}
