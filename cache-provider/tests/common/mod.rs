#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cache_provider::{CacheProvider, ConnectionOptions, ConnectionState, ConnectionTarget};
use common_redis::{Connector, MockConnectScript, MockConnector, MockRedisClient};

pub const PROVIDER_ID: &str = "app";

pub fn target() -> ConnectionTarget {
    ConnectionTarget::new("localhost", 6379, ConnectionOptions::default())
}

pub fn provider_with(connector: Arc<dyn Connector>) -> CacheProvider {
    CacheProvider::new(PROVIDER_ID, target(), connector)
}

pub fn provider(script: MockConnectScript) -> (CacheProvider, MockConnector) {
    let connector = MockConnector::new(MockRedisClient::new(), script);
    (provider_with(Arc::new(connector.clone())), connector)
}

/// A connected provider on a fresh in-memory backend.
pub async fn ready_provider() -> (CacheProvider, MockConnector) {
    let (provider, connector) = provider(MockConnectScript::Ready);
    provider
        .connect()
        .await
        .expect("mock backend should connect");
    (provider, connector)
}

pub async fn wait_for_state(provider: &CacheProvider, state: ConnectionState) {
    let mut changes = provider.state_changes();
    tokio::time::timeout(Duration::from_secs(1), changes.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("provider never reached {state}"))
        .expect("provider dropped its state channel");
}
