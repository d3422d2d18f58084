// SPDX-License-Identifier: Apache-2.0

//! Supervisor core: run one command and record everything about it
//!
//! [`run`] always ends with a status document carrying `start_time`,
//! `end_time` and `exit_code`, whatever happens in between:
//!
//! - spawn failure: `exit_code` is the OS error number
//! - any other failure after spawn (including a panic): `exit_code` is `-1`
//! - child killed by a signal: `exit_code` is the negated signal number

use std::borrow::Cow;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::logger::{LogStream, StreamLogger};
use crate::status::{ProcessStatus, StatusFile};

/// Marker wrapped around arguments that must reach the command with their
/// surrounding double quotes intact.
pub const DQ_MARKER: &str = "#DQ#";

/// Exit code recorded for failures that have no better code.
pub const UNEXPECTED_FAILURE: i32 = -1;

/// Restores `#DQ#text#DQ#` to `"text"`; anything else is returned unchanged.
pub fn unquote_arg(arg: &str) -> Cow<'_, str> {
    match arg
        .strip_prefix(DQ_MARKER)
        .and_then(|rest| rest.strip_suffix(DQ_MARKER))
    {
        Some(inner) => Cow::Owned(format!("\"{inner}\"")),
        None => Cow::Borrowed(arg),
    }
}

/// Inverse of [`unquote_arg`] for arguments that start and end with `"`.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    match arg
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => Cow::Owned(format!("{DQ_MARKER}{inner}{DQ_MARKER}")),
        None => Cow::Borrowed(arg),
    }
}

/// Everything the supervisor needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    out_dir: PathBuf,
    proc_id: Option<String>,
}

impl ExecutorContext {
    pub fn new(out_dir: impl Into<PathBuf>, proc_id: Option<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            proc_id,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn proc_id(&self) -> Option<&str> {
        self.proc_id.as_deref()
    }

    pub fn status_file(&self) -> StatusFile {
        StatusFile::in_dir(&self.out_dir)
    }

    /// Name of the supervisor's own diagnostic log for process `pid`.
    pub fn diagnostic_log_name(pid: u32) -> String {
        format!("log_{pid}")
    }

    /// Value to pass as `PGPASSWORD`, taken from the variable named by the
    /// process id.
    fn password(&self) -> Option<(String, std::ffi::OsString)> {
        let id = self.proc_id.as_deref().filter(|id| !id.is_empty())?;
        std::env::var_os(id).map(|value| (id.to_string(), value))
    }
}

/// Runs `command` to completion and returns the final status, which has
/// already been written to `<out_dir>/status`.
pub fn run(ctx: &ExecutorContext, command: &[String]) -> ProcessStatus {
    let status_file = ctx.status_file();
    let mut status = ProcessStatus::started(std::process::id());
    persist(&status_file, &status);
    info!(
        out_dir = %ctx.out_dir.display(),
        proc_id = ?ctx.proc_id(),
        command = ?command,
        "Supervisor started"
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        supervise(ctx, command, &status_file, &mut status)
    }));

    let exit_code = match outcome {
        Ok(code) => code,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            error!(
                "EXCEPTION: supervisor panicked: {}\n{}",
                message,
                Backtrace::force_capture()
            );
            UNEXPECTED_FAILURE
        }
    };

    status.finish(exit_code);
    persist(&status_file, &status);
    info!(exit_code, pid = status.pid, "Supervisor finished");
    status
}

fn persist(file: &StatusFile, status: &ProcessStatus) {
    if let Err(e) = file.write(status) {
        error!(path = %file.path().display(), "Failed to write status: {}", e);
    }
}

fn supervise(
    ctx: &ExecutorContext,
    command: &[String],
    status_file: &StatusFile,
    status: &mut ProcessStatus,
) -> i32 {
    let mut stdout_log = match StreamLogger::open(ctx.out_dir(), LogStream::Stdout) {
        Ok(logger) => logger,
        Err(e) => {
            error!("EXCEPTION: cannot open stdout log: {}", e);
            return e.raw_os_error().unwrap_or(UNEXPECTED_FAILURE);
        }
    };
    let mut stderr_log = match StreamLogger::open(ctx.out_dir(), LogStream::Stderr) {
        Ok(logger) => logger,
        Err(e) => {
            error!("EXCEPTION: cannot open stderr log: {}", e);
            return e.raw_os_error().unwrap_or(UNEXPECTED_FAILURE);
        }
    };

    let Some((program, args)) = command.split_first() else {
        error!("EXCEPTION: no command given");
        if let Err(log_err) = stderr_log.log(b"No command given") {
            warn!("Failed to record missing command in stderr log: {}", log_err);
        }
        return UNEXPECTED_FAILURE;
    };

    let mut cmd = build_command(ctx, program, args);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(
                "EXCEPTION: failed to spawn '{}': {}\n{}",
                program,
                e,
                Backtrace::force_capture()
            );
            if let Err(log_err) = stderr_log.log(e.to_string().as_bytes()) {
                warn!("Failed to record spawn error in stderr log: {}", log_err);
            }
            return e.raw_os_error().unwrap_or(UNEXPECTED_FAILURE);
        }
    };

    status.pid = child.id();
    persist(status_file, status);
    info!(child_pid = status.pid, "Command spawned");

    let drains = match start_drains(&mut child, stdout_log, stderr_log) {
        Ok(drains) => drains,
        Err(e) => {
            error!("EXCEPTION: cannot start log readers: {}", e);
            let _ = child.kill();
            let _ = child.wait();
            return UNEXPECTED_FAILURE;
        }
    };

    let exit_code = match child.wait() {
        Ok(exit) => exit_code_of(exit),
        Err(e) => {
            error!("EXCEPTION: waiting for child failed: {}", e);
            UNEXPECTED_FAILURE
        }
    };

    // Readers stop at end of stream, which may come after the exit when a
    // grandchild still holds the pipe.
    for handle in drains {
        let name = handle.thread().name().unwrap_or("drain").to_string();
        match handle.join() {
            Ok(Ok(lines)) => debug!(reader = %name, lines, "Stream drained"),
            Ok(Err(e)) => warn!(reader = %name, "Stream reader failed: {}", e),
            Err(_) => error!(reader = %name, "EXCEPTION: stream reader panicked"),
        }
    }

    exit_code
}

fn build_command(ctx: &ExecutorContext, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(unquote_arg(program).into_owned());
    cmd.args(args.iter().map(|arg| unquote_arg(arg).into_owned()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some((name, password)) = ctx.password() {
        debug!("Passing the one-shot password through PGPASSWORD");
        cmd.env("PGPASSWORD", password).env_remove(name);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: the hook only calls signal(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(crate::detach::restore_default_signals);
        }
    }

    cmd
}

type Drain = JoinHandle<std::io::Result<u64>>;

fn start_drains(
    child: &mut Child,
    mut stdout_log: StreamLogger,
    mut stderr_log: StreamLogger,
) -> std::io::Result<Vec<Drain>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        handles.push(
            thread::Builder::new()
                .name("pgexec-drain-out".into())
                .spawn(move || stdout_log.drain(pipe))?,
        );
    }
    if let Some(pipe) = child.stderr.take() {
        handles.push(
            thread::Builder::new()
                .name("pgexec-drain-err".into())
                .spawn(move || stderr_log.drain(pipe))?,
        );
    }
    Ok(handles)
}

#[cfg(unix)]
fn exit_code_of(exit: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (exit.code(), exit.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => UNEXPECTED_FAILURE,
    }
}

#[cfg(not(unix))]
fn exit_code_of(exit: ExitStatus) -> i32 {
    exit.code().unwrap_or(UNEXPECTED_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquote_arg() {
        assert_eq!(unquote_arg("#DQ#my table#DQ#"), "\"my table\"");
        assert_eq!(unquote_arg("#DQ##DQ#"), "\"\"");
        assert_eq!(unquote_arg("plain"), "plain");
        assert_eq!(unquote_arg("#DQ#"), "#DQ#");
        assert_eq!(unquote_arg("#DQ#unterminated"), "#DQ#unterminated");
    }

    #[test]
    fn test_quote_arg_inverts_unquote() {
        assert_eq!(quote_arg("\"public\".\"t\""), "#DQ#public\".\"t#DQ#");
        assert_eq!(quote_arg("--verbose"), "--verbose");
        assert_eq!(quote_arg("\""), "\"");
        for original in ["\"x y\"", "\"\"", "no quotes"] {
            assert_eq!(unquote_arg(&quote_arg(original)), original);
        }
    }

    #[test]
    fn test_diagnostic_log_name() {
        assert_eq!(ExecutorContext::diagnostic_log_name(4242), "log_4242");
    }

    #[test]
    fn test_empty_command_still_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutorContext::new(dir.path(), None);

        let status = run(&ctx, &[]);
        assert_eq!(status.exit_code, Some(UNEXPECTED_FAILURE));
        assert!(status.start_time.is_some());
        assert!(status.end_time.is_some());

        let stored = ctx.status_file().read().unwrap().unwrap();
        assert_eq!(stored, status);
    }
}
