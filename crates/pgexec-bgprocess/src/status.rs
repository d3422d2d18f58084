// SPDX-License-Identifier: Apache-2.0

//! Status document of a supervised process
//!
//! The document is rewritten as a whole on every update. Writers always send
//! the complete known state; there is no merging with what is on disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, ProcessResult};

/// `2024-01-31 12:00:00.123456 +0000`
pub const STATUS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f %z";

pub fn format_status_time(at: DateTime<Utc>) -> String {
    at.format(STATUS_TIME_FORMAT).to_string()
}

pub fn parse_status_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, STATUS_TIME_FORMAT).ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
}

impl ProcessStatus {
    /// Initial document, written before anything is spawned.
    pub fn started(pid: u32) -> Self {
        Self {
            pid,
            start_time: Some(format_status_time(Utc::now())),
            end_time: None,
            exit_code: None,
        }
    }

    /// Records the terminal state. Only the first call has an effect.
    pub fn finish(&mut self, exit_code: i32) {
        if self.exit_code.is_some() {
            return;
        }
        self.exit_code = Some(exit_code);
        self.end_time = Some(format_status_time(Utc::now()));
    }

    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Seconds between start and end, or between start and `now` while the
    /// process is still running.
    pub fn execution_time(&self, now: DateTime<Utc>) -> Option<f64> {
        let start = parse_status_time(self.start_time.as_deref()?)?;
        let end = match self.end_time.as_deref() {
            Some(raw) => parse_status_time(raw)?,
            None => now.fixed_offset(),
        };
        let elapsed = end.signed_duration_since(start);
        Some(elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0)
    }
}

/// The `status` file inside a process output directory.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub const FILE_NAME: &'static str = "status";

    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the document atomically (temporary file plus rename), so a
    /// concurrent reader never observes a partial write.
    pub fn write(&self, status: &ProcessStatus) -> ProcessResult<()> {
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec(status).map_err(|e| ProcessError::InvalidStatus {
            path: self.path.clone(),
            source: e,
        })?;
        fs::write(&tmp, body).map_err(|e| ProcessError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| ProcessError::io(&self.path, e))
    }

    /// Returns `None` when nothing has been written yet.
    pub fn read(&self) -> ProcessResult<Option<ProcessStatus>> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProcessError::io(&self.path, e)),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| ProcessError::InvalidStatus {
                path: self.path.clone(),
                source: e,
            })
    }
}
