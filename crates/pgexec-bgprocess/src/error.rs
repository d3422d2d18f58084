// SPDX-License-Identifier: Apache-2.0

//! Error types for background process supervision

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid status document {path}: {source}")]
    InvalidStatus {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid process manifest {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No command given")]
    MissingCommand,

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to detach from the parent process: {message}")]
    Detach { message: String },

    #[error("Process not found: {id}")]
    NotFound { id: String },

    #[error("Invalid process id: {id}")]
    InvalidId { id: String },

    #[error("The process has already been started.")]
    AlreadyStarted,

    #[error("The process has already finished and can not be restarted.")]
    AlreadyFinished,
}

impl ProcessError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn detach(msg: impl Into<String>) -> Self {
        Self::Detach { message: msg.into() }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
