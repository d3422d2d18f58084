// SPDX-License-Identifier: Apache-2.0

//! Async Query Bridge
//!
//! Drives one dedicated connection per query transaction from stateless
//! requests: `execute` dispatches a statement to a worker thread and returns at
//! once, `poll` collects the outcome, and the remaining operations manage the
//! transaction around it.
//!
//! ## Ordering
//!
//! Every operation that writes a transaction back to the session store holds
//! that transaction's dispatch lock, so writes for one transaction id are
//! strictly ordered. `execute` writes twice: once with the owning worker
//! recorded, once after the worker has started. The worker itself never
//! touches the store; it parks its outcome in the connection's execution
//! slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, field, info, instrument, warn, Instrument};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::execution::{ExecutionOutcome, ExecutionSlot, SlotPoll};
use crate::engine::registry::ServerRegistry;
use crate::engine::session_store::SessionStore;
use crate::engine::traits::{AsyncConnection, ConnectionManager};
use crate::engine::transaction::{main_conn_id, DispatchInfo, QueryTransaction};
use crate::engine::types::{
    AsyncStatus, ColumnInfo, DatabaseTarget, EditorKind, Notification, Row, ServerId,
    TransactionStatus,
};
use crate::metrics;

/// Info code sent with a 404 when the transaction id is unknown
pub const DATAGRID_TRANSACTION_REQUIRED: &str = "DATAGRID_TRANSACTION_REQUIRED";

pub const ERROR_MSG_TRANS_ID_NOT_FOUND: &str = "Transaction ID not found in the session.";
pub const ERROR_MSG_OBJECT_NOT_FOUND: &str =
    "Either Transaction object or Session object not found.";
pub const ERROR_MSG_NOT_CONNECTED: &str =
    "Not connected to server or connection with the server has been closed.";
const ERROR_MSG_STATUS_CHECK_FAILED: &str = "Transaction status check failed.";

/// Outcome of a bridge operation, shaped for an HTTP handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Reply<T> {
    Data(T),
    NotFound { info: String, message: String },
    InternalError { message: String },
}

impl<T> Reply<T> {
    fn transaction_required() -> Self {
        Self::NotFound {
            info: DATAGRID_TRANSACTION_REQUIRED.to_string(),
            message: ERROR_MSG_TRANS_ID_NOT_FOUND.to_string(),
        }
    }

    fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Data(_) => 200,
            Self::NotFound { .. } => 404,
            Self::InternalError { .. } => 500,
        }
    }

    pub fn data(self) -> Option<T> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Reply of `execute`: `status` only says whether the statement was dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteReply {
    pub status: bool,
    pub result: Option<String>,
    pub can_edit: bool,
    pub can_filter: bool,
    pub notifies: Option<Vec<Notification>>,
    pub transaction_status: Option<TransactionStatus>,
}

impl ExecuteReply {
    fn rejected(message: impl Into<String>, trans: Option<&QueryTransaction>) -> Self {
        Self {
            status: false,
            result: Some(message.into()),
            can_edit: trans.map(QueryTransaction::can_edit).unwrap_or(false),
            can_filter: trans.map(QueryTransaction::can_filter).unwrap_or(false),
            notifies: None,
            transaction_status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollStatus {
    Success,
    Busy,
    Cancel,
    Error,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReply {
    pub status: PollStatus,
    pub async_status: AsyncStatus,
    /// Error text, server status message, or why nothing could be polled
    pub result: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub rows_affected: Option<u64>,
    pub rows_fetched: u64,
    pub primary_keys: Option<Vec<String>>,
    pub transaction_status: Option<TransactionStatus>,
}

impl PollReply {
    fn empty(status: PollStatus, async_status: AsyncStatus, result: Option<String>) -> Self {
        Self {
            status,
            async_status,
            result,
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: None,
            rows_fetched: 0,
            primary_keys: None,
            transaction_status: None,
        }
    }

    fn not_connected(message: impl Into<String>) -> Self {
        Self::empty(
            PollStatus::NotConnected,
            AsyncStatus::NotConnected,
            Some(message.into()),
        )
    }
}

/// Generic `{status, result}` reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReply {
    pub status: bool,
    pub result: Option<String>,
}

impl StatusReply {
    fn ok() -> Self {
        Self {
            status: true,
            result: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            result: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatusReply {
    pub status: TransactionStatus,
    pub message: String,
}

impl From<TransactionStatus> for TransactionStatusReply {
    fn from(status: TransactionStatus) -> Self {
        Self {
            status,
            message: status.description().to_string(),
        }
    }
}

/// Why a transaction could not be loaded
enum Lookup {
    Missing,
    Invalid,
}

impl Lookup {
    fn message(&self) -> &'static str {
        match self {
            Self::Missing => ERROR_MSG_TRANS_ID_NOT_FOUND,
            Self::Invalid => ERROR_MSG_OBJECT_NOT_FOUND,
        }
    }
}

fn load_transaction(store: &dyn SessionStore, trans_id: &str) -> Result<QueryTransaction, Lookup> {
    let bytes = store.load(trans_id).ok_or(Lookup::Missing)?;
    QueryTransaction::decode(&bytes).map_err(|e| {
        warn!(trans_id = %trans_id, error = %e, "Stored transaction could not be decoded");
        Lookup::Invalid
    })
}

fn save_transaction(
    store: &dyn SessionStore,
    trans_id: &str,
    trans: &QueryTransaction,
) -> EngineResult<()> {
    store.store(trans_id, trans.encode()?);
    Ok(())
}

/// Slot key: one slot per dedicated connection
type SlotKey = (ServerId, u32, String);

/// Everything a worker needs, handed over explicitly.
struct DispatchJob {
    conn: Arc<dyn AsyncConnection>,
    slot: Arc<ExecutionSlot>,
    sql: String,
    auto_rollback: bool,
    worker_id: u64,
}

impl DispatchJob {
    async fn run(self) {
        let start = Instant::now();
        let result = self.conn.execute_async(&self.sql).await;
        let elapsed_ms = start.elapsed().as_micros() as f64 / 1000.0;

        match &result {
            Ok(res) => debug!(rows = res.rows.len(), elapsed_ms, "Statement completed"),
            Err(e) => debug!(error = %e, elapsed_ms, "Statement failed"),
        }
        metrics::record_execution(elapsed_ms, result.is_ok());

        let connection_gone = matches!(
            result,
            Err(EngineError::ConnectionLost { .. }) | Err(EngineError::SshTunnelLost { .. })
        );
        if self.auto_rollback && !connection_gone {
            rollback_failed_block(self.conn.as_ref()).await;
        }

        let outcome = ExecutionOutcome::from_result(result);
        if !self.slot.complete(self.worker_id, outcome) {
            warn!(worker_id = self.worker_id, "Execution slot was reclaimed before completion");
        }
    }
}

/// Issues `ROLLBACK;` when the connection sits in a failed transaction block.
/// Returns the status left behind.
async fn rollback_failed_block(conn: &dyn AsyncConnection) -> Option<TransactionStatus> {
    match conn.transaction_status().await {
        Ok(TransactionStatus::InError) => match conn.execute_void("ROLLBACK;").await {
            Ok(()) => {
                metrics::record_auto_rollback();
                info!(conn_id = %conn.conn_id(), "Rolled back failed transaction block");
                Some(TransactionStatus::Idle)
            }
            Err(e) => {
                warn!(conn_id = %conn.conn_id(), error = %e, "Automatic rollback failed");
                Some(TransactionStatus::InError)
            }
        },
        Ok(status) => Some(status),
        Err(e) => {
            warn!(conn_id = %conn.conn_id(), error = %e, "Could not read transaction status");
            None
        }
    }
}

fn spawn_worker(
    job: DispatchJob,
    runtime: tokio::runtime::Handle,
    started: oneshot::Sender<()>,
) -> std::io::Result<()> {
    let span = tracing::Span::current();
    thread::Builder::new()
        .name(format!("pgexec-query-{}", job.worker_id))
        .spawn(move || {
            let _ = started.send(());
            runtime.block_on(job.run().instrument(span));
        })
        .map(|_| ())
}

pub struct QueryBridge {
    registry: Arc<ServerRegistry>,
    slots: parking_lot::Mutex<HashMap<SlotKey, Arc<ExecutionSlot>>>,
    dispatch_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_worker: AtomicU64,
}

impl QueryBridge {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            slots: parking_lot::Mutex::new(HashMap::new()),
            dispatch_locks: parking_lot::Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    fn dispatch_lock(&self, trans_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dispatch_locks.lock();
        Arc::clone(locks.entry(trans_id.to_string()).or_default())
    }

    /// Drops the lock of a transaction the store does not know, unless
    /// another caller is queued on it.
    fn forget_lock(&self, trans_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.dispatch_locks.lock();
        let ours = locks.get(trans_id).is_some_and(|entry| Arc::ptr_eq(entry, lock));
        if ours && Arc::strong_count(lock) <= 2 {
            locks.remove(trans_id);
        }
    }

    fn slot(&self, trans: &QueryTransaction, conn_id: &str) -> Arc<ExecutionSlot> {
        let key = (trans.server_id, trans.database.id, conn_id.to_string());
        Arc::clone(self.slots.lock().entry(key).or_default())
    }

    fn existing_slot(&self, trans: &QueryTransaction, conn_id: &str) -> Option<Arc<ExecutionSlot>> {
        let key = (trans.server_id, trans.database.id, conn_id.to_string());
        self.slots.lock().get(&key).cloned()
    }

    /// Live status, without touching a connection that a worker is using.
    async fn live_status(
        conn: &dyn AsyncConnection,
        slot: &ExecutionSlot,
    ) -> EngineResult<TransactionStatus> {
        if slot.is_running() {
            return Ok(TransactionStatus::Active);
        }
        conn.transaction_status().await
    }

    /// Opens a query transaction for `database` and stores it under a new id.
    #[instrument(skip(self, store, database, editor), fields(database_id = database.id))]
    pub fn initialize(
        &self,
        store: &dyn SessionStore,
        server_id: ServerId,
        database: DatabaseTarget,
        editor: EditorKind,
    ) -> EngineResult<String> {
        self.registry.manager(server_id)?;
        let trans_id = uuid::Uuid::new_v4().simple().to_string();
        let trans = QueryTransaction::new(server_id, database, editor);
        save_transaction(store, &trans_id, &trans)?;
        info!(trans_id = %trans_id, "Query transaction initialized");
        Ok(trans_id)
    }

    /// Dispatches `sql` on the transaction's dedicated connection.
    ///
    /// Connection loss, tunnel loss, a missing key store key and a required
    /// password come back as `Err` for the caller to handle; every other
    /// failure is turned into a reply.
    #[instrument(
        skip(self, store, sql),
        fields(
            sql_len = sql.len(),
            server_id = field::Empty,
            database_id = field::Empty,
            conn_id = field::Empty
        )
    )]
    pub async fn execute(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        sql: &str,
        connect: bool,
    ) -> EngineResult<Reply<ExecuteReply>> {
        let lock = self.dispatch_lock(trans_id);
        let _guard = lock.lock().await;

        let mut trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(Lookup::Missing) => {
                self.forget_lock(trans_id, &lock);
                return Ok(Reply::transaction_required());
            }
            Err(lookup) => return Ok(Reply::Data(ExecuteReply::rejected(lookup.message(), None))),
        };

        match self.dispatch(store, trans_id, &mut trans, sql, connect).await {
            Ok(reply) => Ok(Reply::Data(reply)),
            Err(e) if e.is_request_fatal() => {
                warn!(error = %e, "Dispatch aborted by connection state");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Query dispatch failed");
                Ok(Reply::internal_error(e.to_string()))
            }
        }
    }

    async fn dispatch(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        trans: &mut QueryTransaction,
        sql: &str,
        connect: bool,
    ) -> EngineResult<ExecuteReply> {
        let manager = self.registry.manager(trans.server_id)?;
        let fresh = trans.conn_id.is_none();
        let conn_id = trans.ensure_conn_id().to_string();

        let span = tracing::Span::current();
        span.record("server_id", trans.server_id);
        span.record("database_id", trans.database.id);
        span.record("conn_id", field::display(&conn_id));

        let conn = manager.connection(&trans.database, &conn_id);
        let slot = self.slot(trans, &conn_id);
        if slot.is_running() {
            metrics::record_rejected();
            return Ok(ExecuteReply::rejected(
                EngineError::ExecutionInProgress.to_string(),
                Some(trans),
            ));
        }

        // A connection id is only kept once a statement was dispatched on it
        let (status_before, implicit_begin) =
            match Self::prepare(conn.as_ref(), trans, sql, connect).await {
                Ok(Some(prepared)) => prepared,
                Ok(None) => {
                    if fresh {
                        self.discard_connection(manager.as_ref(), trans, &conn_id).await;
                    }
                    return Ok(ExecuteReply::rejected(ERROR_MSG_NOT_CONNECTED, Some(trans)));
                }
                Err(e) => {
                    if fresh {
                        self.discard_connection(manager.as_ref(), trans, &conn_id).await;
                    }
                    return Err(e);
                }
            };

        let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        slot.reserve(worker_id)?;
        trans.worker_id = Some(worker_id);
        if let Err(e) = save_transaction(store, trans_id, trans) {
            slot.abandon(worker_id);
            return Err(e);
        }

        let job = DispatchJob {
            conn: Arc::clone(&conn),
            slot: Arc::clone(&slot),
            sql: sql.to_string(),
            auto_rollback: trans.auto_rollback,
            worker_id,
        };
        let (started_tx, started_rx) = oneshot::channel();
        if let Err(e) = spawn_worker(job, tokio::runtime::Handle::current(), started_tx) {
            slot.abandon(worker_id);
            return Err(EngineError::internal(format!("Failed to start query worker: {e}")));
        }
        let _ = started_rx.await;

        trans.last_dispatch = Some(DispatchInfo {
            worker_id,
            dispatched_at: Utc::now(),
            auto_commit: trans.auto_commit,
            auto_rollback: trans.auto_rollback,
            transaction_status: status_before,
            implicit_begin,
        });
        save_transaction(store, trans_id, trans)?;
        metrics::record_dispatch();
        info!(worker_id, implicit_begin, "Query dispatched");

        let transaction_status = Self::live_status(conn.as_ref(), &slot).await?;
        Ok(ExecuteReply {
            status: true,
            result: None,
            can_edit: trans.can_edit(),
            can_filter: trans.can_filter(),
            notifies: conn.notifies(),
            transaction_status: Some(transaction_status),
        })
    }

    /// Connects if asked to and opens the implicit block. Returns the status
    /// seen before dispatch and whether `BEGIN` was issued, or `None` when
    /// the connection is not live.
    async fn prepare(
        conn: &dyn AsyncConnection,
        trans: &mut QueryTransaction,
        sql: &str,
        connect: bool,
    ) -> EngineResult<Option<(TransactionStatus, bool)>> {
        if connect && !conn.connected() {
            conn.connect().await?;
        }
        if !conn.connected() {
            return Ok(None);
        }

        trans.fetched_row_count = 0;

        let status_before = conn.transaction_status().await?;
        let implicit_begin = !trans.auto_commit
            && status_before == TransactionStatus::Idle
            && pgexec_sql::is_begin_required(sql);
        if implicit_begin {
            conn.execute_void("BEGIN;").await?;
            metrics::record_implicit_begin();
            debug!("Implicit BEGIN issued");
        }
        Ok(Some((status_before, implicit_begin)))
    }

    /// Collects the outcome of the last dispatch, if it finished.
    #[instrument(skip(self, store))]
    pub async fn poll(&self, store: &dyn SessionStore, trans_id: &str) -> EngineResult<Reply<PollReply>> {
        let lock = self.dispatch_lock(trans_id);
        let _guard = lock.lock().await;

        let mut trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(lookup) => {
                if matches!(lookup, Lookup::Missing) {
                    self.forget_lock(trans_id, &lock);
                }
                return Ok(Reply::Data(PollReply::not_connected(lookup.message())));
            }
        };
        let Some(conn_id) = trans.conn_id.clone() else {
            return Ok(Reply::Data(PollReply::not_connected(ERROR_MSG_NOT_CONNECTED)));
        };
        let manager = match self.registry.manager(trans.server_id) {
            Ok(manager) => manager,
            Err(e) => return Ok(Reply::internal_error(e.to_string())),
        };
        let conn = manager.connection(&trans.database, &conn_id);
        let slot = self.slot(&trans, &conn_id);
        if !conn.connected() && !slot.is_running() {
            // A worker that lost the connection still left its outcome
            if let SlotPoll::Finished(ExecutionOutcome::ConnectionLost(msg)) = slot.poll_take() {
                trans.worker_id = None;
                save_transaction(store, trans_id, &trans)?;
                return Ok(Reply::Data(PollReply::not_connected(msg)));
            }
            return Ok(Reply::Data(PollReply::not_connected(ERROR_MSG_NOT_CONNECTED)));
        }

        let polled = slot.poll_take();
        let finished = matches!(polled, SlotPoll::Finished(_));
        let mut reply = match polled {
            SlotPoll::Running { .. } => {
                return Ok(Reply::Data(PollReply::empty(
                    PollStatus::Busy,
                    AsyncStatus::ReadTimeout,
                    None,
                )))
            }
            SlotPoll::Idle => PollReply::empty(PollStatus::Success, AsyncStatus::Ok, None),
            SlotPoll::Finished(outcome) => {
                trans.worker_id = None;
                let async_status = outcome.async_status();
                match outcome {
                    ExecutionOutcome::Completed(result) => PollReply {
                        status: PollStatus::Success,
                        async_status,
                        result: result.status_message,
                        rows_fetched: result.rows.len() as u64,
                        columns: result.columns,
                        rows: result.rows,
                        rows_affected: result.affected_rows,
                        primary_keys: None,
                        transaction_status: None,
                    },
                    ExecutionOutcome::Failed(msg) => {
                        PollReply::empty(PollStatus::Error, async_status, Some(msg))
                    }
                    ExecutionOutcome::Cancelled(msg) => {
                        PollReply::empty(PollStatus::Cancel, async_status, Some(msg))
                    }
                    ExecutionOutcome::ConnectionLost(msg) => {
                        save_transaction(store, trans_id, &trans)?;
                        return Ok(Reply::Data(PollReply::not_connected(msg)));
                    }
                }
            }
        };

        if let EditorKind::ViewData { primary_keys, .. } = &trans.editor {
            reply.primary_keys = Some(primary_keys.clone());
        }

        let status = match conn.transaction_status().await {
            Ok(status) => status,
            Err(e) if e.is_request_fatal() => return Err(e),
            Err(e) => return Ok(Reply::Data(PollReply::not_connected(e.to_string()))),
        };
        reply.transaction_status = if status == TransactionStatus::InError && trans.auto_rollback {
            rollback_failed_block(conn.as_ref()).await
        } else {
            Some(status)
        };

        if reply.rows_fetched > 0 {
            trans.fetched_row_count += reply.rows_fetched;
            reply.rows_fetched = trans.fetched_row_count;
        }
        if finished {
            save_transaction(store, trans_id, &trans)?;
        }
        Ok(Reply::Data(reply))
    }

    /// Asks the server to cancel the running statement, from the database's
    /// main connection. The worker is left to finish on its own.
    #[instrument(skip(self, store))]
    pub async fn cancel_transaction(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
    ) -> EngineResult<Reply<StatusReply>> {
        let trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(lookup) => return Ok(Reply::Data(StatusReply::failed(lookup.message()))),
        };
        let manager = match self.registry.manager(trans.server_id) {
            Ok(manager) => manager,
            Err(e) => return Ok(Reply::internal_error(e.to_string())),
        };
        let target_pid = trans
            .conn_id
            .as_deref()
            .and_then(|conn_id| manager.connection(&trans.database, conn_id).backend_pid());
        let Some(pid) = target_pid else {
            return Ok(Reply::Data(StatusReply::failed(ERROR_MSG_NOT_CONNECTED)));
        };

        match cancel_backend(manager.as_ref(), &trans.database, pid).await {
            Ok(true) => {
                metrics::record_cancel();
                info!(backend_pid = pid, "Cancel requested");
                Ok(Reply::Data(StatusReply::ok()))
            }
            Ok(false) => Ok(Reply::Data(StatusReply {
                status: false,
                result: None,
            })),
            Err(e) if e.is_request_fatal() => Err(e),
            Err(e) => {
                error!(error = %e, "Cancel request failed");
                Ok(Reply::internal_error(e.to_string()))
            }
        }
    }

    pub async fn commit(&self, store: &dyn SessionStore, trans_id: &str) -> EngineResult<Reply<StatusReply>> {
        self.end_transaction(store, trans_id, "COMMIT;").await
    }

    pub async fn rollback(&self, store: &dyn SessionStore, trans_id: &str) -> EngineResult<Reply<StatusReply>> {
        self.end_transaction(store, trans_id, "ROLLBACK;").await
    }

    #[instrument(skip(self, store))]
    async fn end_transaction(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        statement: &str,
    ) -> EngineResult<Reply<StatusReply>> {
        let lock = self.dispatch_lock(trans_id);
        let _guard = lock.lock().await;

        let trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(Lookup::Missing) => {
                self.forget_lock(trans_id, &lock);
                return Ok(Reply::transaction_required());
            }
            Err(lookup) => return Ok(Reply::Data(StatusReply::failed(lookup.message()))),
        };
        let Some(conn_id) = trans.conn_id.as_deref() else {
            return Ok(Reply::Data(StatusReply::failed(ERROR_MSG_NOT_CONNECTED)));
        };
        let manager = match self.registry.manager(trans.server_id) {
            Ok(manager) => manager,
            Err(e) => return Ok(Reply::internal_error(e.to_string())),
        };
        let conn = manager.connection(&trans.database, conn_id);
        if !conn.connected() {
            return Ok(Reply::Data(StatusReply::failed(ERROR_MSG_NOT_CONNECTED)));
        }
        if self.existing_slot(&trans, conn_id).is_some_and(|slot| slot.is_running()) {
            return Ok(Reply::Data(StatusReply::failed(
                EngineError::ExecutionInProgress.to_string(),
            )));
        }

        match conn.execute_void(statement).await {
            Ok(()) => Ok(Reply::Data(StatusReply::ok())),
            Err(e) if e.is_request_fatal() => Err(e),
            Err(e) => Ok(Reply::Data(StatusReply::failed(e.to_string()))),
        }
    }

    pub async fn set_auto_commit(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        auto_commit: bool,
    ) -> EngineResult<Reply<StatusReply>> {
        self.update_transaction(store, trans_id, |trans| trans.auto_commit = auto_commit)
            .await
    }

    pub async fn set_auto_rollback(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        auto_rollback: bool,
    ) -> EngineResult<Reply<StatusReply>> {
        self.update_transaction(store, trans_id, |trans| trans.auto_rollback = auto_rollback)
            .await
    }

    async fn update_transaction<F>(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
        update: F,
    ) -> EngineResult<Reply<StatusReply>>
    where
        F: FnOnce(&mut QueryTransaction),
    {
        let lock = self.dispatch_lock(trans_id);
        let _guard = lock.lock().await;

        let mut trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(lookup) => {
                if matches!(lookup, Lookup::Missing) {
                    self.forget_lock(trans_id, &lock);
                }
                return Ok(Reply::Data(StatusReply::failed(lookup.message())));
            }
        };
        update(&mut trans);
        save_transaction(store, trans_id, &trans)?;
        Ok(Reply::Data(StatusReply::ok()))
    }

    /// Reads the status from the live connection; never cached.
    #[instrument(skip(self, store))]
    pub async fn transaction_status(
        &self,
        store: &dyn SessionStore,
        trans_id: &str,
    ) -> EngineResult<Reply<TransactionStatusReply>> {
        let trans = match load_transaction(store, trans_id) {
            Ok(trans) => trans,
            Err(Lookup::Missing) => return Ok(Reply::transaction_required()),
            Err(_) => return Ok(Reply::internal_error(ERROR_MSG_STATUS_CHECK_FAILED)),
        };
        let (Some(conn_id), Ok(manager)) =
            (trans.conn_id.as_deref(), self.registry.manager(trans.server_id))
        else {
            return Ok(Reply::internal_error(ERROR_MSG_STATUS_CHECK_FAILED));
        };
        let conn = manager.connection(&trans.database, conn_id);
        if !conn.connected() {
            return Ok(Reply::internal_error(ERROR_MSG_STATUS_CHECK_FAILED));
        }

        let running = self.existing_slot(&trans, conn_id).is_some_and(|slot| slot.is_running());
        let status = if running {
            Ok(TransactionStatus::Active)
        } else {
            conn.transaction_status().await
        };
        match status {
            Ok(status) => Ok(Reply::Data(status.into())),
            Err(e) if e.is_request_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Transaction status check failed");
                Ok(Reply::internal_error(ERROR_MSG_STATUS_CHECK_FAILED))
            }
        }
    }

    /// Removes the transaction and releases its dedicated connection.
    /// Returns false if the id was unknown.
    #[instrument(skip(self, store))]
    pub async fn close(&self, store: &dyn SessionStore, trans_id: &str) -> EngineResult<bool> {
        let lock = self.dispatch_lock(trans_id);
        let guard = lock.lock().await;

        let trans = load_transaction(store, trans_id).ok();
        let existed = store.remove(trans_id);

        if let Some(trans) = trans {
            if let Some(conn_id) = trans.conn_id.as_deref() {
                if let Ok(manager) = self.registry.manager(trans.server_id) {
                    self.release_connection(manager.as_ref(), &trans, conn_id).await;
                }
                let key = (trans.server_id, trans.database.id, conn_id.to_string());
                self.slots.lock().remove(&key);
            }
        }

        drop(guard);
        self.dispatch_locks.lock().remove(trans_id);
        if existed {
            info!("Query transaction closed");
        }
        Ok(existed)
    }

    /// Forgets a connection that never carried a dispatch.
    async fn discard_connection(
        &self,
        manager: &dyn ConnectionManager,
        trans: &mut QueryTransaction,
        conn_id: &str,
    ) {
        manager.release(trans.database.id, conn_id).await;
        let key = (trans.server_id, trans.database.id, conn_id.to_string());
        self.slots.lock().remove(&key);
        trans.conn_id = None;
    }

    async fn release_connection(
        &self,
        manager: &dyn ConnectionManager,
        trans: &QueryTransaction,
        conn_id: &str,
    ) {
        let running = self
            .existing_slot(trans, conn_id)
            .map(|slot| slot.is_running())
            .unwrap_or(false);
        if running {
            let pid = manager.connection(&trans.database, conn_id).backend_pid();
            if let Some(pid) = pid {
                if let Err(e) = cancel_backend(manager, &trans.database, pid).await {
                    warn!(error = %e, "Failed to cancel running statement on close");
                }
            }
        }
        manager.release(trans.database.id, conn_id).await;
    }
}

/// Runs `pg_cancel_backend` on the database's main connection, opening it
/// for the occasion if needed.
async fn cancel_backend(
    manager: &dyn ConnectionManager,
    database: &DatabaseTarget,
    pid: u32,
) -> EngineResult<bool> {
    let main_id = main_conn_id(database);
    let main = manager.connection(database, &main_id);
    let opened_here = !main.connected();
    if opened_here {
        main.connect().await?;
    }

    let result = main.cancel_backend(pid).await;
    if opened_here {
        manager.release(database.id, &main_id).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session_store::MemorySessionStore;
    use crate::engine::types::QueryResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    const SERVER_ID: ServerId = 1;
    const BLOCKING_SQL: &str = "SELECT pg_sleep(10);";

    #[derive(Default)]
    struct Gate {
        cancelled: AtomicBool,
        notify: Notify,
    }

    /// State shared by all mock connections of one server.
    #[derive(Default)]
    struct MockServer {
        gates: parking_lot::Mutex<HashMap<u32, Arc<Gate>>>,
        next_pid: AtomicU32,
        connect_error: parking_lot::Mutex<Option<EngineError>>,
    }

    struct MockConnection {
        conn_id: String,
        server: Arc<MockServer>,
        connected: AtomicBool,
        pid: AtomicU32,
        status: parking_lot::Mutex<TransactionStatus>,
        statements: parking_lot::Mutex<Vec<String>>,
        cancels_sent: parking_lot::Mutex<Vec<u32>>,
        gate: Arc<Gate>,
    }

    impl MockConnection {
        fn new(conn_id: &str, server: Arc<MockServer>) -> Self {
            Self {
                conn_id: conn_id.to_string(),
                server,
                connected: AtomicBool::new(false),
                pid: AtomicU32::new(0),
                status: parking_lot::Mutex::new(TransactionStatus::Idle),
                statements: parking_lot::Mutex::new(Vec::new()),
                cancels_sent: parking_lot::Mutex::new(Vec::new()),
                gate: Arc::new(Gate::default()),
            }
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().clone()
        }

        /// Mimics the server: a failing statement aborts an open block, and
        /// an aborted block rejects everything but its end.
        fn apply(&self, sql: &str) -> EngineResult<()> {
            self.statements.lock().push(sql.to_string());
            let mut status = self.status.lock();
            let upper = sql.to_ascii_uppercase();
            if upper.starts_with("BEGIN") {
                *status = TransactionStatus::InTrans;
                return Ok(());
            }
            if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
                *status = TransactionStatus::Idle;
                return Ok(());
            }
            if *status == TransactionStatus::InError {
                return Err(EngineError::execution_error(
                    "current transaction is aborted, commands ignored until end of transaction block",
                ));
            }
            if upper.contains("1/0") {
                if *status == TransactionStatus::InTrans {
                    *status = TransactionStatus::InError;
                }
                return Err(EngineError::execution_error("division by zero"));
            }
            Ok(())
        }

        fn abort_block(&self) {
            let mut status = self.status.lock();
            if *status == TransactionStatus::InTrans {
                *status = TransactionStatus::InError;
            }
        }
    }

    #[async_trait]
    impl AsyncConnection for MockConnection {
        fn conn_id(&self) -> &str {
            &self.conn_id
        }

        fn connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self) -> EngineResult<()> {
            if let Some(err) = self.server.connect_error.lock().clone() {
                return Err(err);
            }
            let pid = self.server.next_pid.fetch_add(1, Ordering::SeqCst) + 100;
            self.pid.store(pid, Ordering::SeqCst);
            self.server.gates.lock().insert(pid, Arc::clone(&self.gate));
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn backend_pid(&self) -> Option<u32> {
            match self.pid.load(Ordering::SeqCst) {
                0 => None,
                pid => Some(pid),
            }
        }

        async fn transaction_status(&self) -> EngineResult<TransactionStatus> {
            Ok(*self.status.lock())
        }

        async fn execute_void(&self, sql: &str) -> EngineResult<()> {
            self.apply(sql)
        }

        async fn execute_async(&self, sql: &str) -> EngineResult<QueryResult> {
            if sql == BLOCKING_SQL {
                self.statements.lock().push(sql.to_string());
                self.gate.notify.notified().await;
                if self.gate.cancelled.swap(false, Ordering::SeqCst) {
                    self.abort_block();
                    return Err(EngineError::Cancelled);
                }
                return Ok(QueryResult::with_affected_rows(1, 10.0));
            }
            self.apply(sql)?;
            Ok(QueryResult {
                columns: vec![ColumnInfo {
                    name: "?column?".into(),
                    data_type: "INT4".into(),
                }],
                rows: vec![Row {
                    values: vec![crate::engine::types::Value::Int(1)],
                }],
                affected_rows: Some(1),
                status_message: None,
                execution_time_ms: 0.1,
            })
        }

        async fn cancel_backend(&self, pid: u32) -> EngineResult<bool> {
            self.cancels_sent.lock().push(pid);
            let gate = self.server.gates.lock().get(&pid).cloned();
            Ok(match gate {
                Some(gate) => {
                    gate.cancelled.store(true, Ordering::SeqCst);
                    gate.notify.notify_one();
                    true
                }
                None => false,
            })
        }

        fn notifies(&self) -> Option<Vec<Notification>> {
            None
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockManager {
        server: Arc<MockServer>,
        connections: parking_lot::Mutex<HashMap<String, Arc<MockConnection>>>,
        connection_calls: AtomicUsize,
        released: parking_lot::Mutex<Vec<String>>,
    }

    impl MockManager {
        fn conn(&self, conn_id: &str) -> Arc<MockConnection> {
            self.connections
                .lock()
                .get(conn_id)
                .cloned()
                .expect("connection was never opened")
        }
    }

    #[async_trait]
    impl ConnectionManager for MockManager {
        fn server_id(&self) -> ServerId {
            SERVER_ID
        }

        fn connection(&self, _database: &DatabaseTarget, conn_id: &str) -> Arc<dyn AsyncConnection> {
            self.connection_calls.fetch_add(1, Ordering::SeqCst);
            let mut connections = self.connections.lock();
            let conn = connections
                .entry(conn_id.to_string())
                .or_insert_with(|| Arc::new(MockConnection::new(conn_id, Arc::clone(&self.server))));
            Arc::clone(conn) as Arc<dyn AsyncConnection>
        }

        async fn release(&self, _database_id: u32, conn_id: &str) -> bool {
            self.released.lock().push(conn_id.to_string());
            match self.connections.lock().remove(conn_id) {
                Some(conn) => {
                    conn.connected.store(false, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        }
    }

    struct Fixture {
        bridge: QueryBridge,
        manager: Arc<MockManager>,
        store: MemorySessionStore,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ServerRegistry::new());
            let manager = Arc::new(MockManager::default());
            registry.register(Arc::clone(&manager) as Arc<dyn ConnectionManager>);
            Self {
                bridge: QueryBridge::new(registry),
                manager,
                store: MemorySessionStore::new(),
            }
        }

        async fn open(&self, auto_commit: bool, auto_rollback: bool) -> String {
            let trans_id = self
                .bridge
                .initialize(
                    &self.store,
                    SERVER_ID,
                    DatabaseTarget::new(16384, "app"),
                    EditorKind::QueryTool,
                )
                .unwrap();
            self.bridge
                .set_auto_commit(&self.store, &trans_id, auto_commit)
                .await
                .unwrap();
            self.bridge
                .set_auto_rollback(&self.store, &trans_id, auto_rollback)
                .await
                .unwrap();
            trans_id
        }

        fn stored(&self, trans_id: &str) -> QueryTransaction {
            QueryTransaction::decode(&self.store.load(trans_id).unwrap()).unwrap()
        }

        fn conn_of(&self, trans_id: &str) -> Arc<MockConnection> {
            self.manager.conn(self.stored(trans_id).conn_id.as_deref().unwrap())
        }

        async fn execute(&self, trans_id: &str, sql: &str) -> ExecuteReply {
            self.bridge
                .execute(&self.store, trans_id, sql, true)
                .await
                .unwrap()
                .data()
                .unwrap()
        }

        async fn wait(&self, trans_id: &str) -> PollReply {
            for _ in 0..500 {
                let reply = self.bridge.poll(&self.store, trans_id).await.unwrap().data().unwrap();
                if reply.status != PollStatus::Busy {
                    return reply;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("execution never finished");
        }

        async fn status(&self, trans_id: &str) -> TransactionStatus {
            self.bridge
                .transaction_status(&self.store, trans_id)
                .await
                .unwrap()
                .data()
                .unwrap()
                .status
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_transaction_is_not_found() {
        let fx = Fixture::new();
        let reply = fx.bridge.execute(&fx.store, "nope", "SELECT 1;", true).await.unwrap();

        assert_eq!(reply.http_status(), 404);
        assert_eq!(
            reply,
            Reply::NotFound {
                info: DATAGRID_TRANSACTION_REQUIRED.into(),
                message: ERROR_MSG_TRANS_ID_NOT_FOUND.into(),
            }
        );
        assert_eq!(fx.manager.connection_calls.load(Ordering::SeqCst), 0);
        assert!(fx.store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undecodable_transaction_is_left_alone() {
        let fx = Fixture::new();
        fx.store.store("7", b"not a transaction".to_vec());

        let reply = fx.execute("7", "SELECT 1;").await;
        assert!(!reply.status);
        assert_eq!(reply.result.as_deref(), Some(ERROR_MSG_OBJECT_NOT_FOUND));
        assert_eq!(fx.store.load("7").unwrap(), b"not a transaction".to_vec());
        assert_eq!(fx.manager.connection_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_implicit_begin_before_create_table() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, false).await;

        let reply = fx.execute(&trans_id, "CREATE TABLE public.t1();").await;
        assert!(reply.status);
        assert!(!reply.can_edit);

        let polled = fx.wait(&trans_id).await;
        assert_eq!(polled.status, PollStatus::Success);
        assert_eq!(
            fx.conn_of(&trans_id).statements(),
            vec!["BEGIN;".to_string(), "CREATE TABLE public.t1();".to_string()]
        );
        assert_eq!(fx.status(&trans_id).await, TransactionStatus::InTrans);

        let stored = fx.stored(&trans_id);
        assert!(stored.last_dispatch.unwrap().implicit_begin);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_begin_when_not_wrappable_or_autocommit() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, false).await;
        fx.execute(&trans_id, "VACUUM;").await;
        fx.wait(&trans_id).await;
        assert_eq!(fx.conn_of(&trans_id).statements(), vec!["VACUUM;".to_string()]);

        let auto = fx.open(true, false).await;
        fx.execute(&auto, "CREATE TABLE public.t2();").await;
        fx.wait(&auto).await;
        assert_eq!(
            fx.conn_of(&auto).statements(),
            vec!["CREATE TABLE public.t2();".to_string()]
        );
        assert_eq!(fx.status(&auto).await, TransactionStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_rollback_returns_to_idle() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, true).await;

        assert!(fx.execute(&trans_id, "SELECT 1/0;").await.status);
        let polled = fx.wait(&trans_id).await;
        assert_eq!(polled.status, PollStatus::Error);
        assert_eq!(polled.result.as_deref(), Some("division by zero"));
        assert_eq!(polled.transaction_status, Some(TransactionStatus::Idle));

        assert_eq!(fx.status(&trans_id).await, TransactionStatus::Idle);
        assert_eq!(
            fx.conn_of(&trans_id).statements(),
            vec!["BEGIN;".to_string(), "SELECT 1/0;".to_string(), "ROLLBACK;".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_block_kept_without_auto_rollback() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, false).await;

        fx.execute(&trans_id, "SELECT 1/0;").await;
        let polled = fx.wait(&trans_id).await;
        assert_eq!(polled.transaction_status, Some(TransactionStatus::InError));
        assert_eq!(fx.status(&trans_id).await, TransactionStatus::InError);

        let reply = fx.bridge.rollback(&fx.store, &trans_id).await.unwrap().data().unwrap();
        assert!(reply.status);
        assert_eq!(fx.status(&trans_id).await, TransactionStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_execute_rejected_while_running() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;

        let first = fx.execute(&trans_id, BLOCKING_SQL).await;
        assert!(first.status);
        assert_eq!(first.transaction_status, Some(TransactionStatus::Active));
        let owner = fx.stored(&trans_id).worker_id;
        assert!(owner.is_some());

        let second = fx.execute(&trans_id, "SELECT 2;").await;
        assert!(!second.status);
        assert_eq!(
            second.result,
            Some(EngineError::ExecutionInProgress.to_string())
        );
        let stored = fx.stored(&trans_id);
        assert_eq!(stored.worker_id, owner);
        assert_eq!(stored.last_dispatch.unwrap().worker_id, owner.unwrap());

        let busy = fx.bridge.poll(&fx.store, &trans_id).await.unwrap().data().unwrap();
        assert_eq!(busy.status, PollStatus::Busy);
        assert_eq!(busy.async_status, AsyncStatus::ReadTimeout);

        fx.conn_of(&trans_id).gate.notify.notify_one();
        let done = fx.wait(&trans_id).await;
        assert_eq!(done.status, PollStatus::Success);
        assert_eq!(done.rows_affected, Some(1));
        assert_eq!(fx.conn_of(&trans_id).statements(), vec![BLOCKING_SQL.to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_goes_through_main_connection() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, false).await;

        fx.execute(&trans_id, BLOCKING_SQL).await;
        let target = fx.conn_of(&trans_id);

        let reply = fx
            .bridge
            .cancel_transaction(&fx.store, &trans_id)
            .await
            .unwrap()
            .data()
            .unwrap();
        assert!(reply.status);

        let polled = fx.wait(&trans_id).await;
        assert_eq!(polled.status, PollStatus::Cancel);
        assert_eq!(polled.async_status, AsyncStatus::ExecutionAborted);
        assert_eq!(polled.transaction_status, Some(TransactionStatus::InError));

        // The main connection was opened for the cancel and released again
        assert_eq!(*fx.manager.released.lock(), vec!["DB:app".to_string()]);
        assert!(target.cancels_sent.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_not_connected_without_connect() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;

        let reply = fx
            .bridge
            .execute(&fx.store, &trans_id, "SELECT 1;", false)
            .await
            .unwrap()
            .data()
            .unwrap();
        assert!(!reply.status);
        assert_eq!(reply.result.as_deref(), Some(ERROR_MSG_NOT_CONNECTED));
        assert!(fx.stored(&trans_id).conn_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refused_dispatch_keeps_no_connection() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;

        for _ in 0..50 {
            let reply = fx
                .bridge
                .execute(&fx.store, &trans_id, "SELECT 1;", false)
                .await
                .unwrap()
                .data()
                .unwrap();
            assert!(!reply.status);
        }
        *fx.manager.server.connect_error.lock() = Some(EngineError::connection_failed("refused"));
        for _ in 0..10 {
            let reply = fx.bridge.execute(&fx.store, &trans_id, "SELECT 1;", true).await.unwrap();
            assert_eq!(reply.http_status(), 500);
        }

        assert!(fx.manager.connections.lock().is_empty());
        assert_eq!(fx.manager.released.lock().len(), 60);
        assert!(fx.bridge.slots.lock().is_empty());
        assert!(fx.stored(&trans_id).conn_id.is_none());

        *fx.manager.server.connect_error.lock() = None;
        assert!(fx.execute(&trans_id, "SELECT 1;").await.status);
        fx.wait(&trans_id).await;
        assert_eq!(fx.manager.connections.lock().len(), 1);
        assert_eq!(fx.bridge.slots.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_ids_leave_no_locks() {
        let fx = Fixture::new();
        for n in 0..20 {
            let trans_id = format!("gone-{n}");
            fx.bridge.execute(&fx.store, &trans_id, "SELECT 1;", true).await.unwrap();
            fx.bridge.poll(&fx.store, &trans_id).await.unwrap();
            fx.bridge.commit(&fx.store, &trans_id).await.unwrap();
            fx.bridge.set_auto_rollback(&fx.store, &trans_id, true).await.unwrap();
            fx.bridge.transaction_status(&fx.store, &trans_id).await.unwrap();
        }

        assert!(fx.bridge.dispatch_locks.lock().is_empty());
        assert!(fx.bridge.slots.lock().is_empty());
        assert_eq!(fx.manager.connection_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_collected_outcome_clears_worker() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, false).await;

        fx.execute(&trans_id, BLOCKING_SQL).await;
        let worker_id = fx.stored(&trans_id).worker_id;
        assert!(worker_id.is_some());

        fx.conn_of(&trans_id).gate.notify.notify_one();
        fx.wait(&trans_id).await;
        let stored = fx.stored(&trans_id);
        assert_eq!(stored.worker_id, None);
        assert_eq!(stored.last_dispatch.unwrap().worker_id, worker_id.unwrap());

        fx.execute(&trans_id, "SELECT 1/0;").await;
        let failed = fx.wait(&trans_id).await;
        assert_eq!(failed.status, PollStatus::Error);
        assert_eq!(fx.stored(&trans_id).worker_id, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_password_required_propagates() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;
        *fx.manager.server.connect_error.lock() = Some(EngineError::PasswordRequired {
            server_id: SERVER_ID,
            user: "postgres".into(),
        });

        let result = fx.bridge.execute(&fx.store, &trans_id, "SELECT 1;", true).await;
        assert!(matches!(result, Err(EngineError::PasswordRequired { .. })));

        *fx.manager.server.connect_error.lock() = Some(EngineError::connection_failed("refused"));
        let reply = fx
            .bridge
            .execute(&fx.store, &trans_id, "SELECT 1;", true)
            .await
            .unwrap();
        assert_eq!(reply.http_status(), 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poll_counts_fetched_rows() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;

        fx.execute(&trans_id, "SELECT 1;").await;
        let first = fx.wait(&trans_id).await;
        assert_eq!(first.rows.len(), 1);
        assert_eq!(first.rows_fetched, 1);
        assert_eq!(fx.stored(&trans_id).fetched_row_count, 1);

        fx.execute(&trans_id, "SELECT 1;").await;
        assert_eq!(fx.stored(&trans_id).fetched_row_count, 0);
        fx.wait(&trans_id).await;
        assert_eq!(fx.stored(&trans_id).fetched_row_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_toggles_and_status_description() {
        let fx = Fixture::new();
        let trans_id = fx.open(false, true).await;
        let stored = fx.stored(&trans_id);
        assert!(!stored.auto_commit);
        assert!(stored.auto_rollback);

        let missing = fx
            .bridge
            .set_auto_commit(&fx.store, "missing", true)
            .await
            .unwrap()
            .data()
            .unwrap();
        assert_eq!(missing.result.as_deref(), Some(ERROR_MSG_TRANS_ID_NOT_FOUND));

        fx.execute(&trans_id, "SELECT 1;").await;
        fx.wait(&trans_id).await;
        let status = fx
            .bridge
            .transaction_status(&fx.store, &trans_id)
            .await
            .unwrap()
            .data()
            .unwrap();
        assert_eq!(status.status, TransactionStatus::InTrans);
        assert_eq!(status.message, "The session is idle in a valid transaction block.");

        let commit = fx.bridge.commit(&fx.store, &trans_id).await.unwrap().data().unwrap();
        assert!(commit.status);
        assert_eq!(fx.status(&trans_id).await, TransactionStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_releases_connection() {
        let fx = Fixture::new();
        let trans_id = fx.open(true, false).await;
        fx.execute(&trans_id, "SELECT 1;").await;
        fx.wait(&trans_id).await;
        let conn_id = fx.stored(&trans_id).conn_id.unwrap();

        assert!(fx.bridge.close(&fx.store, &trans_id).await.unwrap());
        assert!(!fx.store.contains(&trans_id));
        assert_eq!(*fx.manager.released.lock(), vec![conn_id]);
        assert!(!fx.bridge.close(&fx.store, &trans_id).await.unwrap());

        let status = fx.bridge.transaction_status(&fx.store, &trans_id).await.unwrap();
        assert_eq!(status.http_status(), 404);
    }

    /// Store that keeps every version written, to check write ordering.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemorySessionStore,
        writes: parking_lot::Mutex<Vec<QueryTransaction>>,
    }

    impl SessionStore for RecordingStore {
        fn load(&self, trans_id: &str) -> Option<Vec<u8>> {
            self.inner.load(trans_id)
        }

        fn store(&self, trans_id: &str, entry: Vec<u8>) {
            self.writes.lock().push(QueryTransaction::decode(&entry).unwrap());
            self.inner.store(trans_id, entry);
        }

        fn remove(&self, trans_id: &str) -> bool {
            self.inner.remove(trans_id)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_persists_before_and_after_start() {
        let fx = Fixture::new();
        let store = RecordingStore::default();
        let trans_id = fx
            .bridge
            .initialize(&store, SERVER_ID, DatabaseTarget::new(1, "app"), EditorKind::QueryTool)
            .unwrap();
        store.writes.lock().clear();

        let reply = fx.bridge.execute(&store, &trans_id, BLOCKING_SQL, true).await.unwrap();
        assert!(reply.data().unwrap().status);

        let writes = store.writes.lock().clone();
        assert_eq!(writes.len(), 2);
        let worker_id = writes[0].worker_id.unwrap();
        assert!(writes[0].last_dispatch.is_none());
        assert_eq!(writes[1].worker_id, Some(worker_id));
        assert_eq!(writes[1].last_dispatch.as_ref().unwrap().worker_id, worker_id);
        assert_eq!(writes[0].conn_id, writes[1].conn_id);

        let conn_id = writes[1].conn_id.clone().unwrap();
        fx.manager.conn(&conn_id).gate.notify.notify_one();
    }
}
