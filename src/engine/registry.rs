// SPDX-License-Identifier: Apache-2.0

//! Server Registry
//!
//! Maps server ids to the connection manager owning that server's
//! dedicated connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::ConnectionManager;
use crate::engine::types::ServerId;

pub struct ServerRegistry {
    managers: RwLock<HashMap<ServerId, Arc<dyn ConnectionManager>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a manager under its `server_id()`, replacing any previous one.
    pub fn register(&self, manager: Arc<dyn ConnectionManager>) {
        self.managers.write().insert(manager.server_id(), manager);
    }

    pub fn unregister(&self, server_id: ServerId) -> Option<Arc<dyn ConnectionManager>> {
        self.managers.write().remove(&server_id)
    }

    pub fn get(&self, server_id: ServerId) -> Option<Arc<dyn ConnectionManager>> {
        self.managers.read().get(&server_id).cloned()
    }

    pub fn manager(&self, server_id: ServerId) -> EngineResult<Arc<dyn ConnectionManager>> {
        self.get(server_id)
            .ok_or_else(|| EngineError::server_not_found(server_id))
    }

    /// Registered server ids, sorted
    pub fn list(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.managers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.read().is_empty()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
