// SPDX-License-Identifier: Apache-2.0

//! Connection abstractions driven by the query bridge
//!
//! A `ConnectionManager` owns the dedicated connections of one server. Each
//! `AsyncConnection` is used by exactly one query transaction; the bridge
//! guarantees that only one task touches it at a time, except for
//! `cancel_backend`, which is always issued on a different connection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{
    DatabaseTarget, Notification, QueryResult, ServerId, TransactionStatus,
};

#[async_trait]
pub trait AsyncConnection: Send + Sync {
    fn conn_id(&self) -> &str;

    /// True when the connection handshake completed and the link is live.
    fn connected(&self) -> bool;

    /// Completes the connection and authentication handshake.
    async fn connect(&self) -> EngineResult<()>;

    /// Server process serving this connection, once connected.
    fn backend_pid(&self) -> Option<u32>;

    /// Reads the transaction status from the live connection.
    async fn transaction_status(&self) -> EngineResult<TransactionStatus>;

    /// Runs a statement synchronously, discarding any rows.
    async fn execute_void(&self, sql: &str) -> EngineResult<()>;

    /// Runs a statement or script and collects the last result set.
    async fn execute_async(&self, sql: &str) -> EngineResult<QueryResult>;

    /// Asks the server to cancel whatever `pid` is running. Returns the
    /// server's answer.
    async fn cancel_backend(&self, pid: u32) -> EngineResult<bool>;

    /// Notifications received since the last call, when the driver supports
    /// them.
    fn notifies(&self) -> Option<Vec<Notification>>;

    async fn close(&self);
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn server_id(&self) -> ServerId;

    /// Returns the connection for `(database, conn_id)`, creating an
    /// unconnected handle on first use.
    fn connection(&self, database: &DatabaseTarget, conn_id: &str) -> Arc<dyn AsyncConnection>;

    /// Closes and forgets a connection. Returns false if it was unknown.
    async fn release(&self, database_id: u32, conn_id: &str) -> bool;
}
