// SPDX-License-Identifier: Apache-2.0

//! Timestamped append-only stream logs (`out` and `err`)
//!
//! Each line is written as `<YYYYMMDDhhmmssffffff>,<raw bytes>\n`. The token
//! before the first comma sorts chronologically as a plain string, which is
//! what readers rely on when tailing.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

pub const LOG_TIME_FORMAT: &str = "%Y%m%d%H%M%S%6f";

pub fn log_timestamp() -> String {
    Utc::now().format(LOG_TIME_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn file_name(self) -> &'static str {
        match self {
            LogStream::Stdout => "out",
            LogStream::Stderr => "err",
        }
    }
}

pub struct StreamLogger {
    stream: LogStream,
    path: PathBuf,
    file: File,
}

impl StreamLogger {
    /// Opens (creating if needed) the log for `stream` in append mode.
    pub fn open(dir: &Path, stream: LogStream) -> io::Result<Self> {
        let path = dir.join(stream.file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { stream, path, file })
    }

    pub fn stream(&self) -> LogStream {
        self.stream
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. A missing trailing newline is added; empty input is
    /// ignored.
    pub fn log(&mut self, line: &[u8]) -> io::Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let mut entry = Vec::with_capacity(line.len() + 22);
        entry.extend_from_slice(log_timestamp().as_bytes());
        entry.push(b',');
        entry.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            entry.push(b'\n');
        }
        // One write per entry so concurrent tailers see whole lines.
        self.file.write_all(&entry)
    }

    /// Copies `reader` line by line into the log until end of stream.
    ///
    /// Returns the number of entries written.
    pub fn drain<R: Read>(&mut self, reader: R) -> io::Result<u64> {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            self.log(&line)?;
            count += 1;
        }
        self.file.flush()?;
        Ok(count)
    }
}
