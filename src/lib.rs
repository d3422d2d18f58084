// SPDX-License-Identifier: Apache-2.0

// pgexec - asynchronous PostgreSQL query bridge and detached process runner
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod observability;

use std::sync::Arc;

use commands::bgprocess::BackgroundProcesses;
use commands::query::QueryBridge;
use config::Settings;
use engine::drivers::postgres::PgConnectionManager;
use engine::{MemorySessionStore, ServerConfig, ServerId, ServerRegistry};

pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<ServerRegistry>,
    pub bridge: Arc<QueryBridge>,
    pub processes: BackgroundProcesses,
    /// Default session store for embedders without one of their own
    pub sessions: Arc<MemorySessionStore>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        let bridge = Arc::new(QueryBridge::new(Arc::clone(&registry)));
        let processes = BackgroundProcesses::new(&settings);

        Self {
            settings,
            registry,
            bridge,
            processes,
            sessions: Arc::new(MemorySessionStore::new()),
        }
    }

    /// Makes a PostgreSQL server available to query transactions, replacing
    /// any earlier registration under the same id.
    pub fn register_server(&self, config: ServerConfig) -> Arc<PgConnectionManager> {
        let manager = Arc::new(PgConnectionManager::new(config, self.settings.connect_timeout));
        self.registry.register(manager.clone());
        tracing::info!(server_id = manager.config().server_id, "Server registered");
        manager
    }

    pub fn unregister_server(&self, server_id: ServerId) -> bool {
        self.registry.unregister(server_id).is_some()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

/// Loads settings, installs the log subscriber and builds the shared state.
pub fn init() -> AppState {
    let settings = Settings::load();
    observability::init_tracing(&settings);
    AppState::new(settings)
}
