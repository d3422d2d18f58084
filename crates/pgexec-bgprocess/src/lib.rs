// SPDX-License-Identifier: Apache-2.0

//! Detached background process supervision
//!
//! The `pgexec-executor` binary is the supervisor: it detaches from whoever
//! launched it, runs one command, and records the command's output and final
//! status under an output directory. [`BatchProcess`] is the other side,
//! used by the application to prepare, launch and inspect such processes.

pub mod batch;
pub mod detach;
pub mod error;
pub mod executor;
pub mod logger;
pub mod observability;
pub mod status;

pub use batch::{BatchProcess, LogOffsets, ProcessReport, ProcessSummary, StreamChunk};
pub use error::{ProcessError, ProcessResult};
pub use executor::{quote_arg, unquote_arg, ExecutorContext};
pub use status::{ProcessStatus, StatusFile};
