use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cache::Cache;
use crate::client::{RpcClient, Transport};
use crate::config::{CacheConfig, SystemConfig};
use crate::event::EventBus;

/// Wires the event bus and the rpc client together from one config.
///
/// The client publishes its lifecycle events on the bus handed out by
/// [`event_bus`](Self::event_bus), so subscribers observe traffic
/// without holding the client itself.
pub struct System {
    event_bus: Arc<EventBus>,
    client: Arc<RpcClient>,
    cache_config: CacheConfig,
}

impl System {
    /// Requires a running tokio runtime; the client spawns its queue
    /// drain task at construction.
    pub fn new(config: SystemConfig, transport: Arc<dyn Transport>) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_bus));
        let client = Arc::new(RpcClient::new(config.client, transport, event_bus.clone()));
        debug!("System initialized");
        Self {
            event_bus,
            client,
            cache_config: config.cache,
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn client(&self) -> Arc<RpcClient> {
        self.client.clone()
    }

    /// Builds a typed cache from the system's cache section. Each call
    /// is an independent cache; share a handle by cloning it.
    pub fn new_cache<T>(&self) -> Cache<T>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        Cache::new(self.cache_config.clone())
    }

    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        debug!("System shut down");
    }
}
