// SPDX-License-Identifier: Apache-2.0

//! Background process commands.
//!
//! Thin layer over [`BatchProcess`] bound to the configured process root and
//! supervisor binary.

use std::path::{Path, PathBuf};

use pgexec_bgprocess::{BatchProcess, LogOffsets, ProcessReport, ProcessResult, ProcessSummary};
use serde::Serialize;
use tracing::{error, instrument};

use crate::config::Settings;
use crate::observability::Sensitive;

/// Response wrapper shared by the process commands
#[derive(Debug, Serialize)]
pub struct ProcessResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> From<ProcessResult<T>> for ProcessResponse<T> {
    fn from(result: ProcessResult<T>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => {
                error!(error = %err, "Background process command failed");
                Self {
                    success: false,
                    data: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundProcesses {
    root: PathBuf,
    executor: PathBuf,
}

impl BackgroundProcesses {
    pub fn new(settings: &Settings) -> Self {
        Self {
            root: settings.process_dir.clone(),
            executor: settings.executor.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a command without running it. Returns the process id.
    pub fn create(
        &self,
        description: &str,
        command: &str,
        arguments: Vec<String>,
    ) -> ProcessResponse<String> {
        BatchProcess::create(&self.root, description, command, arguments)
            .map(|process| process.id().to_string())
            .into()
    }

    #[instrument(skip(self, password))]
    pub fn start(&self, id: &str, password: Option<Sensitive<String>>) -> ProcessResponse<()> {
        self.start_inner(id, password.as_ref()).into()
    }

    fn start_inner(&self, id: &str, password: Option<&Sensitive<String>>) -> ProcessResult<()> {
        let process = BatchProcess::open(&self.root, id)?;
        process.start(&self.executor, password.map(|p| p.expose().as_str()))
    }

    pub fn status(&self, id: &str, offsets: Option<LogOffsets>) -> ProcessResponse<ProcessReport> {
        BatchProcess::open(&self.root, id)
            .and_then(|process| process.status(offsets))
            .into()
    }

    pub fn list(&self) -> ProcessResponse<Vec<ProcessSummary>> {
        BatchProcess::list(&self.root).into()
    }

    pub fn acknowledge(&self, id: &str) -> ProcessResponse<()> {
        BatchProcess::acknowledge(&self.root, id).into()
    }

    pub fn release(&self, id: &str) -> ProcessResponse<()> {
        BatchProcess::release(&self.root, id).into()
    }
}
