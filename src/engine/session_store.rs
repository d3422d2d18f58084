// SPDX-License-Identifier: Apache-2.0

//! Server-side session storage for query transactions
//!
//! Entries are opaque bytes keyed by transaction id and are always read and
//! written as a whole.

use std::collections::HashMap;

use parking_lot::RwLock;

pub trait SessionStore: Send + Sync {
    fn load(&self, trans_id: &str) -> Option<Vec<u8>>;

    fn store(&self, trans_id: &str, entry: Vec<u8>);

    /// Returns true when an entry was removed.
    fn remove(&self, trans_id: &str) -> bool;

    fn contains(&self, trans_id: &str) -> bool {
        self.load(trans_id).is_some()
    }
}

/// In-process store backing a single user session
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    grid_data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.grid_data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid_data.read().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, trans_id: &str) -> Option<Vec<u8>> {
        self.grid_data.read().get(trans_id).cloned()
    }

    fn store(&self, trans_id: &str, entry: Vec<u8>) {
        self.grid_data.write().insert(trans_id.to_string(), entry);
    }

    fn remove(&self, trans_id: &str) -> bool {
        self.grid_data.write().remove(trans_id).is_some()
    }

    fn contains(&self, trans_id: &str) -> bool {
        self.grid_data.read().contains_key(trans_id)
    }
}
