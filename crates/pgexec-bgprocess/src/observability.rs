// SPDX-License-Identifier: Apache-2.0

//! Diagnostic log of the supervisor itself (`<out_dir>/log_<pid>`)

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use crate::error::{ProcessError, ProcessResult};
use crate::executor::ExecutorContext;

pub const LOG_FILTER_ENV: &str = "PGEXEC_EXECUTOR_LOG";

/// Installs a plain-text subscriber writing to `log_<pid>` in `out_dir`.
///
/// Filtered by `PGEXEC_EXECUTOR_LOG`, defaulting to `debug` so that lifecycle
/// events are always recorded.
pub fn init_diagnostics(out_dir: &Path) -> ProcessResult<()> {
    let file_name = ExecutorContext::diagnostic_log_name(std::process::id());
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(&file_name)
        .build(out_dir)
        .map_err(|e| ProcessError::io(out_dir.join(&file_name), std::io::Error::other(e)))?;

    let env_filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(appender)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .map_err(|e| ProcessError::io(out_dir.join(&file_name), std::io::Error::other(e)))
}
