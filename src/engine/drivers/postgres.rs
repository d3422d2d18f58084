// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Driver
//!
//! Implements the connection traits with one dedicated SQLx `PgConnection` per
//! `(database, conn_id)`.
//!
//! ## Execution
//!
//! Scripts are sent through the simple query protocol so that several
//! statements can run in one round trip; the rows of the last statement that
//! produced any are returned.
//!
//! ## Transaction status
//!
//! SQLx does not expose the backend's ReadyForQuery indicator, so the status is
//! read with a simple Query message: inside a transaction block `now()`
//! (transaction start) differs from `statement_timestamp()`, and inside a
//! failed block every statement is rejected with SQLSTATE `25P02`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, Connection, Either, Executor, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{AsyncConnection, ConnectionManager};
use crate::engine::types::{
    ColumnInfo, ConnectionKey, DatabaseTarget, Notification, QueryResult, Row as QRow,
    ServerConfig, ServerId, TransactionStatus, Value,
};

const STATUS_QUERY: &str = "SELECT now() <> statement_timestamp()";
const APPLICATION_NAME: &str = "pgexec";

const SQLSTATE_IN_FAILED_TRANSACTION: &str = "25P02";
const SQLSTATE_QUERY_CANCELED: &str = "57014";
const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";
const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";

/// Builds the connect options of `config` for one database.
pub fn connect_options(config: &ServerConfig, database: &str) -> PgConnectOptions {
    let ssl_mode = if config.ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Disable
    };
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .database(database)
        .application_name(APPLICATION_NAME)
        .ssl_mode(ssl_mode);

    match &config.password {
        Some(password) => options.password(password.expose()),
        None => options,
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Maps an error raised while a statement was running.
fn map_execution_error(err: sqlx::Error) -> EngineError {
    match sqlstate(&err).as_deref() {
        Some(SQLSTATE_QUERY_CANCELED) => return EngineError::Cancelled,
        Some(SQLSTATE_ADMIN_SHUTDOWN) => return EngineError::connection_lost(err.to_string()),
        _ => {}
    }
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => {
            EngineError::connection_lost(err.to_string())
        }
        sqlx::Error::Database(db) => EngineError::execution_error(db.message().to_string()),
        other => EngineError::execution_error(other.to_string()),
    }
}

/// A single dedicated connection
pub struct PgAsyncConnection {
    server_id: ServerId,
    conn_id: String,
    options: PgConnectOptions,
    has_password: bool,
    connect_timeout: Duration,
    conn: Mutex<Option<PgConnection>>,
    connected: AtomicBool,
    // 0 while disconnected
    backend_pid: AtomicU32,
}

impl PgAsyncConnection {
    pub fn new(
        config: &ServerConfig,
        database: &DatabaseTarget,
        conn_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server_id: config.server_id,
            conn_id: conn_id.into(),
            options: connect_options(config, &database.name),
            has_password: config.password.is_some(),
            connect_timeout,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            backend_pid: AtomicU32::new(0),
        }
    }

    fn map_connect_error(&self, err: sqlx::Error) -> EngineError {
        let code = sqlstate(&err);
        let msg = err.to_string();
        let password_rejected = matches!(
            code.as_deref(),
            Some(SQLSTATE_INVALID_PASSWORD) | Some(SQLSTATE_INVALID_AUTHORIZATION)
        ) || msg.contains("password");

        if password_rejected && !self.has_password {
            EngineError::PasswordRequired {
                server_id: self.server_id,
                user: self.options.get_username().to_string(),
            }
        } else if password_rejected {
            EngineError::auth_failed(msg)
        } else {
            EngineError::connection_failed(msg)
        }
    }

    /// Drops the link after an I/O failure so later calls report it.
    fn mark_lost(&self, slot: &mut Option<PgConnection>) {
        slot.take();
        self.connected.store(false, Ordering::SeqCst);
        self.backend_pid.store(0, Ordering::SeqCst);
    }

    async fn fetch_backend_pid(conn: &mut PgConnection) -> EngineResult<u32> {
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        u32::try_from(pid).map_err(|_| EngineError::internal(format!("invalid backend pid {pid}")))
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(|d| Value::Text(d.format("%Y-%m-%d").to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v.map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string())).unwrap_or(Value::Null);
        }

        // Simple-protocol rows arrive as text, so anything else is shown verbatim
        match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => raw
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }

    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
            })
            .collect()
    }

    async fn run_script(conn: &mut PgConnection, sql: &str) -> Result<QueryResult, sqlx::Error> {
        let start = Instant::now();
        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut affected_rows = None;
        let mut statement_done = false;

        let mut stream = sqlx::raw_sql(sql).fetch_many(&mut *conn);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    affected_rows = Some(done.rows_affected());
                    statement_done = true;
                }
                Either::Right(row) => {
                    // A later result set replaces the earlier one
                    if statement_done {
                        rows.clear();
                        statement_done = false;
                    }
                    if rows.is_empty() {
                        columns = Self::get_column_info(&row);
                    }
                    rows.push(Self::convert_row(&row));
                }
            }
        }
        drop(stream);

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        let status_message = if columns.is_empty() {
            Some(match affected_rows {
                Some(n) => format!("Query returned successfully: {n} rows affected."),
                None => "Query returned successfully.".to_string(),
            })
        } else {
            None
        };

        Ok(QueryResult {
            columns,
            rows,
            affected_rows,
            status_message,
            execution_time_ms,
        })
    }
}

#[async_trait]
impl AsyncConnection for PgAsyncConnection {
    fn conn_id(&self) -> &str {
        &self.conn_id
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(conn_id = %self.conn_id, server_id = self.server_id))]
    async fn connect(&self) -> EngineResult<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let connecting = PgConnection::connect_with(&self.options);
        let mut conn = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| EngineError::Timeout {
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| self.map_connect_error(e))?;

        let pid = Self::fetch_backend_pid(&mut conn).await?;
        debug!(backend_pid = pid, "Dedicated connection established");

        *slot = Some(conn);
        self.backend_pid.store(pid, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_pid(&self) -> Option<u32> {
        match self.backend_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    async fn transaction_status(&self) -> EngineResult<TransactionStatus> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| {
            EngineError::connection_lost("connection is not established")
        })?;

        // Must stay a simple Query message, outside any implicit block
        let in_block = (&mut *conn)
            .fetch_one(STATUS_QUERY)
            .await
            .and_then(|row| row.try_get::<bool, _>(0));
        match in_block {
            Ok(true) => Ok(TransactionStatus::InTrans),
            Ok(false) => Ok(TransactionStatus::Idle),
            Err(e) if sqlstate(&e).as_deref() == Some(SQLSTATE_IN_FAILED_TRANSACTION) => {
                Ok(TransactionStatus::InError)
            }
            Err(e) => {
                let err = map_execution_error(e);
                if matches!(err, EngineError::ConnectionLost { .. }) {
                    self.mark_lost(&mut slot);
                }
                Err(err)
            }
        }
    }

    async fn execute_void(&self, sql: &str) -> EngineResult<()> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| {
            EngineError::connection_lost("connection is not established")
        })?;

        let result = (&mut *conn).execute(sql).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = map_execution_error(e);
                if matches!(err, EngineError::ConnectionLost { .. }) {
                    self.mark_lost(&mut slot);
                }
                Err(err)
            }
        }
    }

    async fn execute_async(&self, sql: &str) -> EngineResult<QueryResult> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| {
            EngineError::connection_lost("connection is not established")
        })?;

        match Self::run_script(conn, sql).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = map_execution_error(e);
                if matches!(err, EngineError::ConnectionLost { .. }) {
                    self.mark_lost(&mut slot);
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(conn_id = %self.conn_id))]
    async fn cancel_backend(&self, pid: u32) -> EngineResult<bool> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| {
            EngineError::connection_lost("connection is not established")
        })?;

        let pid = i32::try_from(pid)
            .map_err(|_| EngineError::internal(format!("invalid backend pid {pid}")))?;
        sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))
    }

    fn notifies(&self) -> Option<Vec<Notification>> {
        None
    }

    async fn close(&self) {
        let conn = {
            let mut slot = self.conn.lock().await;
            self.connected.store(false, Ordering::SeqCst);
            self.backend_pid.store(0, Ordering::SeqCst);
            slot.take()
        };
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!(conn_id = %self.conn_id, error = %e, "Failed to close connection cleanly");
            }
        }
    }
}

/// Owns every dedicated connection of one server.
pub struct PgConnectionManager {
    config: ServerConfig,
    connect_timeout: Duration,
    connections: parking_lot::Mutex<HashMap<ConnectionKey, Arc<PgAsyncConnection>>>,
}

impl PgConnectionManager {
    pub fn new(config: ServerConfig, default_connect_timeout: Duration) -> Self {
        let connect_timeout = config
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_connect_timeout);
        Self {
            config,
            connect_timeout,
            connections: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    fn server_id(&self) -> ServerId {
        self.config.server_id
    }

    fn connection(&self, database: &DatabaseTarget, conn_id: &str) -> Arc<dyn AsyncConnection> {
        let key = ConnectionKey {
            database_id: database.id,
            conn_id: conn_id.to_string(),
        };
        let mut connections = self.connections.lock();
        let conn = connections.entry(key).or_insert_with(|| {
            Arc::new(PgAsyncConnection::new(
                &self.config,
                database,
                conn_id,
                self.connect_timeout,
            ))
        });
        Arc::clone(conn) as Arc<dyn AsyncConnection>
    }

    async fn release(&self, database_id: u32, conn_id: &str) -> bool {
        let key = ConnectionKey {
            database_id,
            conn_id: conn_id.to_string(),
        };
        let removed = self.connections.lock().remove(&key);
        match removed {
            Some(conn) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Sensitive;

    fn config(password: Option<&str>) -> ServerConfig {
        ServerConfig {
            server_id: 1,
            name: "local".to_string(),
            host: "localhost".to_string(),
            port: 5433,
            username: "user".to_string(),
            password: password.map(|p| Sensitive::new(p.to_string())),
            ssl: false,
            connect_timeout_secs: None,
        }
    }

    #[test]
    fn test_connect_options_building() {
        let options = connect_options(&config(Some("pass")), "testdb");
        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "user");
        assert_eq!(options.get_database(), Some("testdb"));
    }

    #[test]
    fn test_manager_reuses_connection_per_key() {
        let manager = PgConnectionManager::new(config(None), Duration::from_secs(10));
        let db = DatabaseTarget::new(16384, "app");

        let first = manager.connection(&db, "CONN:1");
        let again = manager.connection(&db, "CONN:1");
        let other = manager.connection(&db, "CONN:2");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.connection_count(), 2);
        assert!(!first.connected());
        assert_eq!(first.backend_pid(), None);
        assert!(first.notifies().is_none());
    }

    #[tokio::test]
    async fn test_release_forgets_connection() {
        let manager = PgConnectionManager::new(config(None), Duration::from_secs(10));
        let db = DatabaseTarget::new(1, "postgres");
        manager.connection(&db, "CONN:7");

        assert!(manager.release(1, "CONN:7").await);
        assert!(!manager.release(1, "CONN:7").await);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unconnected_connection_reports_lost() {
        let manager = PgConnectionManager::new(config(None), Duration::from_secs(10));
        let conn = manager.connection(&DatabaseTarget::new(1, "postgres"), "CONN:9");
        assert!(matches!(
            conn.execute_async("SELECT 1").await,
            Err(EngineError::ConnectionLost { .. })
        ));
    }
}
