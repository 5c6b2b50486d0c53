//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::SessionRegistry;
use crate::store::{GameStore, RestClient, RestStore};
use crate::ws::gateway::Gateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Durable store when configured, otherwise in-process only
        let store = match &config.store {
            Some(store) => GameStore::Rest(RestStore::new(RestClient::new(&store.url, &store.key))),
            None => GameStore::memory(),
        };

        // Initialize session registry
        let registry = Arc::new(SessionRegistry::new(
            config.join_code_length,
            config.reconnect_policy,
            store,
        ));

        // Realtime gateway over the registry
        let gateway = Gateway::new(registry.clone(), config.abandon_grace);

        Self {
            config,
            registry,
            gateway,
        }
    }
}
