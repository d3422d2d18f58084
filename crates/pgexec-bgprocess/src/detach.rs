// SPDX-License-Identifier: Apache-2.0

//! Detaching the supervisor from the process that launched it
//!
//! After [`detach`] returns [`Detach::Detached`], the calling process no
//! longer belongs to the launcher's session or process group, so the launcher
//! exiting (or its group being signalled) does not take it down.
//!
//! Must be called before any thread is started: on POSIX it forks.

use crate::error::ProcessResult;

/// Environment flag set on the re-executed child on platforms without `fork`.
pub const DETACHED_ENV: &str = "PGEXEC_DETACHED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// This process handed the work off and should exit with status 0.
    HandedOff,
    /// This process is the detached supervisor and should carry on.
    Detached,
}

#[cfg(unix)]
pub fn detach(_already_detached: bool) -> ProcessResult<Detach> {
    use std::fs::File;
    use std::io::{Read, Write};

    use nix::sys::stat::{umask, Mode};
    use nix::unistd::{fork, pipe, setsid, ForkResult};

    use crate::error::ProcessError;

    let (read_end, write_end) = pipe().map_err(|e| ProcessError::detach(e.to_string()))?;

    // SAFETY: no other thread exists yet in this process.
    match unsafe { fork() }.map_err(|e| ProcessError::detach(e.to_string()))? {
        ForkResult::Parent { .. } => {
            drop(write_end);
            let mut ready = [0u8; 1];
            let mut reader = File::from(read_end);
            match reader.read(&mut ready) {
                Ok(1) => Ok(Detach::HandedOff),
                Ok(_) => Err(ProcessError::detach(
                    "supervisor exited before signalling readiness",
                )),
                Err(e) => Err(ProcessError::detach(e.to_string())),
            }
        }
        ForkResult::Child => {
            drop(read_end);
            setsid().map_err(|e| ProcessError::detach(e.to_string()))?;
            umask(Mode::empty());

            let mut writer = File::from(write_end);
            writer
                .write_all(b"1")
                .map_err(|e| ProcessError::detach(e.to_string()))?;
            Ok(Detach::Detached)
        }
    }
}

#[cfg(windows)]
pub fn detach(already_detached: bool) -> ProcessResult<Detach> {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS};

    use crate::error::ProcessError;

    if already_detached {
        return Ok(Detach::Detached);
    }

    let exe = std::env::current_exe().map_err(|e| ProcessError::detach(e.to_string()))?;
    Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(DETACHED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
        .spawn()
        .map_err(|e| ProcessError::detach(e.to_string()))?;

    // Give the new process a moment to start before the launcher sees us exit.
    std::thread::sleep(Duration::from_millis(500));
    Ok(Detach::HandedOff)
}

/// Ignores interrupt and termination signals (and Ctrl-Break on Windows) for
/// the rest of the supervisor's life.
#[cfg(unix)]
pub fn ignore_termination_signals() -> ProcessResult<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    use crate::error::ProcessError;

    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: installing SIG_IGN does not run any code in signal context.
        unsafe { signal(sig, SigHandler::SigIgn) }
            .map_err(|e| ProcessError::detach(format!("ignore {sig:?}: {e}")))?;
    }
    Ok(())
}

/// Puts the dispositions changed by [`ignore_termination_signals`] back to
/// their defaults. Runs in a forked child right before exec, so the
/// supervised command stays interruptible.
#[cfg(unix)]
pub fn restore_default_signals() -> std::io::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: signal(2) is async-signal-safe.
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn ignore_termination_signals() -> ProcessResult<()> {
    use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;

    use crate::error::ProcessError;

    // A null handler with TRUE makes the process ignore Ctrl-C; Ctrl-Break is
    // never delivered to a process without a console.
    // SAFETY: plain Win32 call with no pointers involved.
    if unsafe { SetConsoleCtrlHandler(None, 1) } == 0 {
        return Err(ProcessError::detach(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}
