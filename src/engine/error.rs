// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the query bridge
//!
//! Driver errors are mapped to these variants so that the bridge can decide,
//! per variant, whether a failure ends the request or only the statement.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Connection to the server has been lost: {message}")]
    ConnectionLost { message: String },

    #[error("SSH tunnel to the server has been lost: {message}")]
    SshTunnelLost { message: String },

    #[error("The encryption key for saved credentials is missing")]
    CryptKeyMissing,

    #[error("Password required for {user} on server {server_id}")]
    PasswordRequired { server_id: i32, user: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Server not found: {server_id}")]
    ServerNotFound { server_id: i32 },

    #[error("Transaction ID not found in the session: {trans_id}")]
    TransactionNotFound { trans_id: String },

    #[error("Invalid transaction object: {message}")]
    InvalidTransaction { message: String },

    #[error("A query is already running on this connection")]
    ExecutionInProgress,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost { message: msg.into() }
    }

    pub fn tunnel_lost(msg: impl Into<String>) -> Self {
        Self::SshTunnelLost { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn server_not_found(server_id: i32) -> Self {
        Self::ServerNotFound { server_id }
    }

    pub fn transaction_not_found(trans_id: impl Into<String>) -> Self {
        Self::TransactionNotFound {
            trans_id: trans_id.into(),
        }
    }

    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Self::InvalidTransaction { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Errors the caller must handle itself (reconnect, re-authenticate,
    /// unlock the key store). The bridge never turns these into a reply.
    pub fn is_request_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::SshTunnelLost { .. }
                | Self::CryptKeyMissing
                | Self::PasswordRequired { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_fatal_family() {
        assert!(EngineError::connection_lost("reset by peer").is_request_fatal());
        assert!(EngineError::tunnel_lost("ssh exited").is_request_fatal());
        assert!(EngineError::CryptKeyMissing.is_request_fatal());
        assert!(EngineError::PasswordRequired {
            server_id: 1,
            user: "postgres".into()
        }
        .is_request_fatal());

        assert!(!EngineError::execution_error("division by zero").is_request_fatal());
        assert!(!EngineError::connection_failed("refused").is_request_fatal());
        assert!(!EngineError::internal("bug").is_request_fatal());
    }

    #[test]
    fn test_error_serializes_with_variant_tag() {
        let json = serde_json::to_value(EngineError::server_not_found(3)).unwrap();
        assert_eq!(json["ServerNotFound"]["server_id"], 3);
    }
}
