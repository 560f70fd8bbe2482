use std::str::FromStr;
use std::time;

use common_redis::{ConnectionOptions, ConnectionTarget};
use envconfig::Envconfig;

use crate::store::StorePolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "CACHE_PROVIDER_ID", default = "cache")]
    pub provider_id: String,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(from = "STORE_NAME", default = "probe")]
    pub store_name: String,

    #[envconfig(from = "STORE_EXPIRE_SECONDS", default = "3600")]
    pub store_expire_seconds: u64,
}

impl Config {
    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy::with_expire(self.store_expire_seconds)
    }
}

#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(from = "REDIS_HOST", default = "127.0.0.1")]
    pub host: String,

    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub port: u16,

    #[envconfig(from = "REDIS_DB", default = "0")]
    pub db: i64,

    #[envconfig(from = "REDIS_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "REDIS_PASSWORD")]
    pub password: Option<String>,

    #[envconfig(from = "REDIS_TLS", default = "false")]
    pub tls: bool,

    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS")]
    pub response_timeout: Option<EnvMsDuration>,

    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS")]
    pub connection_timeout: Option<EnvMsDuration>,

    #[envconfig(from = "REDIS_RETRIES", default = "6")]
    pub retries: usize,

    #[envconfig(from = "REDIS_MAX_RETRY_DELAY_MS", default = "2000")]
    pub max_retry_delay: EnvMsDuration,
}

impl RedisConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            db: self.db,
            username: self.username.clone(),
            password: self.password.clone(),
            tls: self.tls,
            response_timeout: self.response_timeout.map(|t| t.0),
            connection_timeout: self.connection_timeout.map(|t| t.0),
            number_of_retries: self.retries,
            max_retry_delay: self.max_retry_delay.0,
        }
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget::new(self.host.clone(), self.port, self.connection_options())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
