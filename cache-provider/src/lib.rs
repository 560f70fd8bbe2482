//! Namespaced cache stores on top of a single Redis connection.
//!
//! A [`CacheProvider`] owns one backend connection and tracks its lifecycle. Stores created
//! on it share that connection, each under its own key namespace
//! `urn:<provider>:<store>:<key>`, with one expiry policy per store.
//!
//! # Example
//!
//! ```rust,ignore
//! use cache_provider::{connect, get_from_cache_or_source, StorePolicy};
//!
//! let provider = connect("sessions-api", "127.0.0.1", 6379, Default::default()).await?;
//! let users = provider.create_store("users", Some(StorePolicy::with_expire(300)))?;
//!
//! users.set("42", &user).await?;
//! let cached: Option<User> = users.get("42").await?;
//!
//! let result = get_from_cache_or_source(&users, "43", |key| async move {
//!     load_user(&key).await
//! })
//! .await?;
//!
//! provider.close().await;
//! ```

pub mod cache_aside;
pub mod config;
pub mod connection;
pub mod error;
pub mod provider;
pub mod store;

pub use cache_aside::{
    get_from_cache_or_source, get_from_cache_or_source_coalesced, CacheResult, CacheSource,
};
pub use common_redis::{ConnectionOptions, ConnectionTarget};
pub use connection::{ConnectionHandle, ConnectionState, ProviderEvent};
pub use error::{CacheAsideError, ProviderError, StoreError};
pub use provider::{connect, connect_with, CacheProvider};
pub use store::{CacheStore, StorePolicy, DEFAULT_EXPIRE_SECONDS};
