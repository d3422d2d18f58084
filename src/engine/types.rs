// SPDX-License-Identifier: Apache-2.0

//! Data types shared by the query bridge, the connection layer and drivers

use serde::{Deserialize, Serialize};

use crate::observability::Sensitive;

/// Identifier of a registered server
pub type ServerId = i32;

/// Database the transaction runs against (`oid` plus name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseTarget {
    pub id: u32,
    pub name: String,
}

impl DatabaseTarget {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A dedicated connection is identified by database and connection id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub database_id: u32,
    pub conn_id: String,
}

/// Connection parameters of one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Sensitive<String>>,
    #[serde(default)]
    pub ssl: bool,
    /// Overrides the application-wide connect timeout
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

/// PostgreSQL's own transaction indicator, read from the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TransactionStatus {
    /// No transaction block is open.
    Idle,
    /// A command is in progress.
    Active,
    /// Idle inside a valid transaction block.
    InTrans,
    /// Idle inside a failed transaction block.
    InError,
}

impl TransactionStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Active => 1,
            Self::InTrans => 2,
            Self::InError => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Active),
            2 => Some(Self::InTrans),
            3 => Some(Self::InError),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Idle => "The session is idle and there is no current transaction.",
            Self::Active => "A command is currently in progress.",
            Self::InTrans => "The session is idle in a valid transaction block.",
            Self::InError => "The session is idle in a failed transaction block.",
        }
    }
}

impl From<TransactionStatus> for u8 {
    fn from(status: TransactionStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("invalid transaction status {code}"))
    }
}

/// Result codes of an asynchronous execution, as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AsyncStatus {
    Ok,
    /// Still waiting for the server's answer.
    ReadTimeout,
    /// Still sending the statement to the server.
    WriteTimeout,
    NotConnected,
    ExecutionAborted,
}

impl AsyncStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 1,
            Self::ReadTimeout => 2,
            Self::WriteTimeout => 3,
            Self::NotConnected => 4,
            Self::ExecutionAborted => 5,
        }
    }
}

impl From<AsyncStatus> for u8 {
    fn from(status: AsyncStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for AsyncStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Ok),
            2 => Ok(Self::ReadTimeout),
            3 => Ok(Self::WriteTimeout),
            4 => Ok(Self::NotConnected),
            5 => Ok(Self::ExecutionAborted),
            other => Err(format!("invalid async status {other}")),
        }
    }
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Outcome of one executed statement or script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// Rows touched by the last statement
    pub affected_rows: Option<u64>,
    /// Server command tag or notice text, when there are no rows
    pub status_message: Option<String>,
    pub execution_time_ms: f64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_affected_rows(affected: u64, time_ms: f64) -> Self {
        Self {
            affected_rows: Some(affected),
            execution_time_ms: time_ms,
            ..Self::default()
        }
    }
}

/// Asynchronous notification received on a connection (LISTEN/NOTIFY)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub pid: u32,
    pub channel: String,
    pub payload: String,
}

/// Which editor a transaction belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditorKind {
    QueryTool,
    ViewData {
        /// Schema-qualified object name
        object: String,
        primary_keys: Vec<String>,
    },
}

impl EditorKind {
    /// Rows can be written back only when they can be addressed by key.
    pub fn can_edit(&self) -> bool {
        matches!(self, Self::ViewData { primary_keys, .. } if !primary_keys.is_empty())
    }

    pub fn can_filter(&self) -> bool {
        matches!(self, Self::ViewData { .. })
    }
}
