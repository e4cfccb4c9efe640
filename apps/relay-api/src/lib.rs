pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod notifications;
pub mod relay;
pub mod routes;

use std::sync::Arc;

use circle_common::SnowflakeGenerator;
use config::Config;
use db::kv::KeyValueStore;
use db::store::Store;
use gateway::presence::PresenceEngine;
use gateway::registry::ConnectionRegistry;
use notifications::{NotificationDispatcher, PushService};
use relay::Relay;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
}

impl AppState {
    /// Wire the registry, presence engine and dispatcher around the given
    /// collaborators.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        kv: Arc<dyn KeyValueStore>,
        push: Arc<dyn PushService>,
        snowflake: Arc<SnowflakeGenerator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceEngine::new(
            registry.clone(),
            store.clone(),
            config.presence.clone(),
            config.store_timeout,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            registry,
            store.clone(),
            push,
            snowflake,
            config.store_timeout,
            config.push.timeout,
        ));

        Self {
            store,
            kv,
            config: Arc::new(config),
            relay: Arc::new(Relay::new(presence, dispatcher)),
        }
    }
}
