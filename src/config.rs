// SPDX-License-Identifier: Apache-2.0

//! Runtime settings read from the environment (and an optional `.env` file).

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_LOG_DIR: &str = "PGEXEC_LOG_DIR";
pub const ENV_LOG_FILTER: &str = "PGEXEC_LOG_FILTER";
pub const ENV_PROCESS_DIR: &str = "PGEXEC_PROCESS_DIR";
pub const ENV_EXECUTOR: &str = "PGEXEC_EXECUTOR";
pub const ENV_CONNECT_TIMEOUT: &str = "PGEXEC_CONNECT_TIMEOUT_SECS";

const APP_DIR: &str = "pgexec";
const DEFAULT_LOG_FILTER: &str = "pgexec=info";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const EXECUTOR_NAME: &str = "pgexec-executor";

#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_filter: String,
    /// Root of the background process output directories
    pub process_dir: PathBuf,
    pub executor: PathBuf,
    pub connect_timeout: Duration,
}

impl Settings {
    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                eprintln!("Failed to read .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = data_directory();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_dir = non_empty(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));
        let process_dir = non_empty(ENV_PROCESS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("process_logs"));
        let executor = non_empty(ENV_EXECUTOR)
            .map(PathBuf::from)
            .unwrap_or_else(default_executor);
        let log_filter = non_empty(ENV_LOG_FILTER).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let connect_timeout_secs = non_empty(ENV_CONNECT_TIMEOUT)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        Self {
            log_dir,
            log_filter,
            process_dir,
            executor,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        }
    }

    pub fn with_process_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.process_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_executor(mut self, executor: impl AsRef<Path>) -> Self {
        self.executor = executor.as_ref().to_path_buf();
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn data_directory() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// `pgexec-executor` next to the running binary
fn default_executor() -> PathBuf {
    let name = format!("{}{}", EXECUTOR_NAME, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}
