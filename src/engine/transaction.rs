// SPDX-License-Identifier: Apache-2.0

//! Query transaction record and its versioned session encoding

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{DatabaseTarget, EditorKind, ServerId, TransactionStatus};

/// Version written into every encoded transaction
pub const ENCODING_VERSION: u32 = 1;

const CONN_ID_PREFIX: &str = "CONN:";
const CONN_ID_MAX: u32 = 9_999_999;

/// Snapshot taken when a query was handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchInfo {
    pub worker_id: u64,
    pub dispatched_at: DateTime<Utc>,
    pub auto_commit: bool,
    pub auto_rollback: bool,
    /// Live status right before the statement was sent
    pub transaction_status: TransactionStatus,
    pub implicit_begin: bool,
}

/// State of one open editor, carried across requests in the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTransaction {
    pub server_id: ServerId,
    pub database: DatabaseTarget,
    /// Dedicated connection, assigned on first execute
    pub conn_id: Option<String>,
    pub auto_commit: bool,
    pub auto_rollback: bool,
    pub fetched_row_count: u64,
    /// Worker owning the current execution
    pub worker_id: Option<u64>,
    pub last_dispatch: Option<DispatchInfo>,
    pub editor: EditorKind,
}

impl QueryTransaction {
    pub fn new(server_id: ServerId, database: DatabaseTarget, editor: EditorKind) -> Self {
        Self {
            server_id,
            database,
            conn_id: None,
            auto_commit: true,
            auto_rollback: false,
            fetched_row_count: 0,
            worker_id: None,
            last_dispatch: None,
            editor,
        }
    }

    pub fn can_edit(&self) -> bool {
        self.editor.can_edit()
    }

    pub fn can_filter(&self) -> bool {
        self.editor.can_filter()
    }

    /// Returns the dedicated connection id, allocating one if needed.
    pub fn ensure_conn_id(&mut self) -> &str {
        self.conn_id.get_or_insert_with(new_conn_id)
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            version: u32,
            transaction: &'a QueryTransaction,
        }

        serde_json::to_vec(&Envelope {
            version: ENCODING_VERSION,
            transaction: self,
        })
        .map_err(|e| EngineError::internal(format!("Failed to encode transaction: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        #[derive(Deserialize)]
        struct Envelope<'a> {
            version: u32,
            #[serde(borrow)]
            transaction: &'a RawValue,
        }

        let envelope: Envelope<'_> = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::invalid_transaction(e.to_string()))?;
        if envelope.version != ENCODING_VERSION {
            return Err(EngineError::invalid_transaction(format!(
                "unsupported encoding version {}",
                envelope.version
            )));
        }
        serde_json::from_str(envelope.transaction.get())
            .map_err(|e| EngineError::invalid_transaction(e.to_string()))
    }
}

/// `CONN:<1..=9999999>`
pub fn new_conn_id() -> String {
    let n = rand::thread_rng().gen_range(1..=CONN_ID_MAX);
    format!("{CONN_ID_PREFIX}{n}")
}

/// Default connection of a database, used for cancellation.
pub fn main_conn_id(database: &DatabaseTarget) -> String {
    format!("DB:{}", database.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryTransaction {
        QueryTransaction::new(
            1,
            DatabaseTarget::new(16384, "app"),
            EditorKind::ViewData {
                object: "public.users".into(),
                primary_keys: vec!["id".into()],
            },
        )
    }

    #[test]
    fn test_defaults() {
        let trans = sample();
        assert!(trans.auto_commit);
        assert!(!trans.auto_rollback);
        assert_eq!(trans.fetched_row_count, 0);
        assert!(trans.conn_id.is_none());
        assert!(trans.can_edit());
    }

    #[test]
    fn test_conn_id_is_stable() {
        let mut trans = sample();
        let first = trans.ensure_conn_id().to_string();
        assert!(first.starts_with("CONN:"));
        let n: u32 = first["CONN:".len()..].parse().unwrap();
        assert!((1..=9_999_999).contains(&n));
        assert_eq!(trans.ensure_conn_id(), first);
    }

    #[test]
    fn test_encoding_carries_version() {
        let mut trans = sample();
        trans.ensure_conn_id();
        trans.worker_id = Some(3);

        let bytes = trans.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["transaction"]["database"]["name"], "app");
        assert_eq!(json["transaction"]["editor"]["kind"], "view_data");

        assert_eq!(QueryTransaction::decode(&bytes).unwrap(), trans);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let bytes = br#"{"version":2,"transaction":{}}"#;
        assert!(matches!(
            QueryTransaction::decode(bytes),
            Err(EngineError::InvalidTransaction { .. })
        ));
        assert!(QueryTransaction::decode(b"\x80\x04garbage").is_err());
    }

    #[test]
    fn test_main_conn_id() {
        assert_eq!(main_conn_id(&DatabaseTarget::new(5, "postgres")), "DB:postgres");
    }
}
