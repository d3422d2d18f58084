// SPDX-License-Identifier: Apache-2.0

//! Launcher and reader side of background processes
//!
//! A [`BatchProcess`] owns one output directory under a common root:
//!
//! ```text
//! <root>/<id>/process.json   manifest written by the launcher
//! <root>/<id>/status         written by the supervisor
//! <root>/<id>/out, err       timestamped stream logs
//! <root>/<id>/log_<pid>      supervisor diagnostics
//! ```

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::executor::quote_arg;
use crate::logger::{log_timestamp, LogStream};
use crate::status::{format_status_time, ProcessStatus, StatusFile};

pub const MANIFEST_FILE: &str = "process.json";

/// Upper bound of lines returned per stream by one [`BatchProcess::status`]
/// read.
pub const MAX_LINES_PER_READ: usize = 5120;

/// Once the process has finished, a second catch-up read is done only when
/// fewer lines than this were returned in total.
const CATCH_UP_THRESHOLD: usize = 3073;

const ID_TIME_FORMAT: &str = "%y%m%d%H%M%S%6f";
const ID_SUFFIX_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessManifest {
    pub id: String,
    pub description: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub acknowledged_at: Option<String>,
}

/// Byte offsets into the `out` and `err` logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOffsets {
    pub out: u64,
    pub err: u64,
}

/// One `[timestamp, text]` entry of a stream log.
pub type LogLine = [String; 2];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamChunk {
    pub pos: u64,
    pub lines: Vec<LogLine>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<StreamChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<StreamChunk>,
    pub exit_code: Option<i32>,
    pub execution_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub id: String,
    pub description: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time: Option<f64>,
    pub acknowledged_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchProcess {
    dir: PathBuf,
    manifest: ProcessManifest,
}

impl BatchProcess {
    /// Allocates a fresh id and a private output directory under `root`.
    #[instrument(skip(root, arguments), fields(root = %root.display()))]
    pub fn create(
        root: &Path,
        description: &str,
        command: &str,
        arguments: Vec<String>,
    ) -> ProcessResult<Self> {
        fs::create_dir_all(root).map_err(|e| ProcessError::io(root, e))?;

        let stamp = Utc::now().format(ID_TIME_FORMAT).to_string();
        let mut rng = rand::thread_rng();
        let mut id = stamp;
        let mut suffix_len = 0;
        let dir = loop {
            id.extend((0..suffix_len).map(|_| {
                ID_SUFFIX_CHARS[rng.gen_range(0..ID_SUFFIX_CHARS.len())] as char
            }));
            let candidate = root.join(&id);
            match create_private_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix_len += 1,
                Err(e) => return Err(ProcessError::io(&candidate, e)),
            }
        };

        let process = Self {
            dir,
            manifest: ProcessManifest {
                id,
                description: description.to_string(),
                command: command.to_string(),
                arguments,
                acknowledged_at: None,
            },
        };
        process.save_manifest()?;
        info!(id = %process.id(), "Background process created");
        Ok(process)
    }

    pub fn open(root: &Path, id: &str) -> ProcessResult<Self> {
        if !is_valid_id(id) {
            return Err(ProcessError::InvalidId { id: id.to_string() });
        }
        let dir = root.join(id);
        let path = dir.join(MANIFEST_FILE);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ProcessError::not_found(id)),
            Err(e) => return Err(ProcessError::io(&path, e)),
        };
        let manifest = serde_json::from_slice(&body)
            .map_err(|e| ProcessError::InvalidManifest { path, source: e })?;
        Ok(Self { dir, manifest })
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &ProcessManifest {
        &self.manifest
    }

    pub fn status_file(&self) -> StatusFile {
        StatusFile::in_dir(&self.dir)
    }

    fn save_manifest(&self) -> ProcessResult<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(&self.manifest).map_err(|e| {
            ProcessError::InvalidManifest {
                path: path.clone(),
                source: e,
            }
        })?;
        fs::write(&path, body).map_err(|e| ProcessError::io(&path, e))
    }

    /// Hands the command to the supervisor at `executor` and waits only for
    /// the hand-off, not for the command.
    ///
    /// `password`, when given, reaches the command as `PGPASSWORD` without
    /// ever appearing on a command line.
    #[instrument(skip(self, executor, password), fields(id = %self.id(), executor = %executor.display()))]
    pub fn start(&self, executor: &Path, password: Option<&str>) -> ProcessResult<()> {
        if let Some(status) = self.status_file().read()? {
            if status.is_finished() {
                return Err(ProcessError::AlreadyFinished);
            }
            if status.is_started() {
                return Err(ProcessError::AlreadyStarted);
            }
        }

        let mut cmd = Command::new(executor);
        cmd.env("PROCID", self.id())
            .env("OUTDIR", &self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("--")
            .arg(quote_arg(&self.manifest.command).into_owned())
            .args(self.manifest.arguments.iter().map(|a| quote_arg(a).into_owned()));
        if let Some(password) = password {
            cmd.env(self.id(), password);
        }

        let exit_code = match cmd.status() {
            Ok(exit) if exit.success() => {
                info!("Supervisor took over");
                return Ok(());
            }
            Ok(exit) => exit.code().unwrap_or(-1),
            Err(e) => {
                warn!("Failed to launch supervisor: {}", e);
                let code = e.raw_os_error().unwrap_or(-1);
                self.record_launch_failure(code)?;
                return Err(ProcessError::Spawn {
                    command: executor.display().to_string(),
                    source: e,
                });
            }
        };

        warn!(exit_code, "Supervisor hand-off failed");
        self.record_launch_failure(exit_code)
    }

    /// Marks the process as finished at once, unless the supervisor already
    /// recorded an exit code of its own.
    fn record_launch_failure(&self, exit_code: i32) -> ProcessResult<()> {
        let file = self.status_file();
        let mut status = file.read()?.unwrap_or_default();
        if status.exit_code.is_none() {
            let now = format_status_time(Utc::now());
            status.start_time = Some(now.clone());
            status.end_time = Some(now);
            status.exit_code = Some(exit_code);
        }
        file.write(&status)
    }

    /// Reads the status and, when `offsets` is given, the log lines written
    /// since those offsets.
    pub fn status(&self, offsets: Option<LogOffsets>) -> ProcessResult<ProcessReport> {
        let cutoff = log_timestamp();
        let mut out = StreamChunk::default();
        let mut err = StreamChunk::default();

        if let Some(offsets) = offsets {
            out.pos = offsets.out;
            err.pos = offsets.err;
            self.read_stream(LogStream::Stdout, &mut out, &cutoff, true)?;
            self.read_stream(LogStream::Stderr, &mut err, &cutoff, true)?;
        }

        let status = self.status_file().read()?;
        let mut exit_code = None;
        let mut execution_time = None;
        match status {
            Some(status) => {
                exit_code = status.exit_code;
                execution_time = status.execution_time(Utc::now());
                let returned = out.lines.len() + err.lines.len();
                if offsets.is_some() && status.is_finished() && returned < CATCH_UP_THRESHOLD {
                    self.read_stream(LogStream::Stdout, &mut out, &cutoff, false)?;
                    self.read_stream(LogStream::Stderr, &mut err, &cutoff, false)?;
                }
            }
            None => {
                out.done = false;
                err.done = false;
            }
        }

        let (out, err) = match offsets {
            Some(_) => (Some(out), Some(err)),
            None => (None, None),
        };
        Ok(ProcessReport {
            out,
            err,
            exit_code,
            execution_time,
        })
    }

    fn read_stream(
        &self,
        stream: LogStream,
        chunk: &mut StreamChunk,
        cutoff: &str,
        check: bool,
    ) -> ProcessResult<()> {
        let path = self.dir.join(stream.file_name());
        match read_log(&path, chunk.pos, cutoff, check, &mut chunk.lines) {
            Ok((pos, done)) => {
                chunk.pos = pos;
                chunk.done = done;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                chunk.done = false;
                Ok(())
            }
            Err(e) => Err(ProcessError::io(&path, e)),
        }
    }

    /// Processes under `root` that have started and were not acknowledged.
    pub fn list(root: &Path) -> ProcessResult<Vec<ProcessSummary>> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProcessError::io(root, e)),
        };

        let now = Utc::now();
        let mut summaries = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().join(MANIFEST_FILE).is_file() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let process = match Self::open(root, &id) {
                Ok(process) => process,
                Err(e) => {
                    warn!(id = %id, "Skipping unreadable process: {}", e);
                    continue;
                }
            };
            if process.manifest.acknowledged_at.is_some() {
                continue;
            }
            let status = match process.status_file().read() {
                Ok(Some(status)) if status.is_started() => status,
                Ok(_) => continue,
                Err(e) => {
                    warn!(id = %id, "Skipping process with unreadable status: {}", e);
                    continue;
                }
            };
            summaries.push(summary(process.manifest, &status, now));
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Stamps the process as seen so it no longer shows up in [`Self::list`].
    pub fn acknowledge(root: &Path, id: &str) -> ProcessResult<()> {
        let mut process = Self::open(root, id)?;
        process.manifest.acknowledged_at = Some(format_status_time(Utc::now()));
        process.save_manifest()
    }

    /// Removes the output directory and everything in it.
    pub fn release(root: &Path, id: &str) -> ProcessResult<()> {
        let process = Self::open(root, id)?;
        fs::remove_dir_all(&process.dir).map_err(|e| ProcessError::io(&process.dir, e))?;
        info!(id = %id, "Background process released");
        Ok(())
    }
}

/// Ids are a timestamp followed by an optional suffix, so anything else
/// could only name a path outside the process root.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| ID_SUFFIX_CHARS.contains(&b))
}

fn summary(
    manifest: ProcessManifest,
    status: &ProcessStatus,
    now: chrono::DateTime<Utc>,
) -> ProcessSummary {
    ProcessSummary {
        id: manifest.id,
        description: manifest.description,
        command: manifest.command,
        arguments: manifest.arguments,
        start_time: status.start_time.clone(),
        end_time: status.end_time.clone(),
        exit_code: status.exit_code,
        execution_time: status.execution_time(now),
        acknowledged_at: manifest.acknowledged_at,
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new().create(path)
}

/// Reads complete log entries from byte offset `pos`.
///
/// Stops early (returning `done = false`) at a partially written line, after
/// [`MAX_LINES_PER_READ`] entries, or, when `check` is set, at the first entry
/// stamped later than `cutoff`. Returns the offset just past the last entry
/// consumed.
fn read_log(
    path: &Path,
    pos: u64,
    cutoff: &str,
    check: bool,
    lines: &mut Vec<LogLine>,
) -> io::Result<(u64, bool)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(pos))?;
    let mut reader = BufReader::new(file);

    let mut pos = pos;
    let mut read = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok((pos, true));
        }
        if !buf.ends_with(b"\n") {
            return Ok((pos, false));
        }

        let entry = &buf[..buf.len() - 1];
        let (stamp, text) = match entry.iter().position(|b| *b == b',') {
            Some(idx) => (&entry[..idx], &entry[idx + 1..]),
            None => (entry, &entry[entry.len()..]),
        };
        let stamp = String::from_utf8_lossy(stamp).into_owned();

        if check && stamp.as_str() > cutoff {
            return Ok((pos, false));
        }
        if read == MAX_LINES_PER_READ {
            return Ok((pos, false));
        }

        lines.push([stamp, String::from_utf8_lossy(text).into_owned()]);
        pos += n as u64;
        read += 1;
    }
}
