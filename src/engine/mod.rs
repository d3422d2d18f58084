// SPDX-License-Identifier: Apache-2.0

// Query Engine Module
// Connection abstraction, transaction state and execution slots

pub mod drivers;
pub mod error;
pub mod execution;
pub mod registry;
pub mod session_store;
pub mod traits;
pub mod transaction;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use registry::ServerRegistry;
pub use session_store::{MemorySessionStore, SessionStore};
pub use traits::{AsyncConnection, ConnectionManager};
pub use transaction::QueryTransaction;
pub use types::*;
