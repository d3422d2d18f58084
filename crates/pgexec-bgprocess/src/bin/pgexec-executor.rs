// SPDX-License-Identifier: Apache-2.0

//! Background process supervisor
//!
//! Usage: `OUTDIR=<dir> PROCID=<id> pgexec-executor -- <command> [args...]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};

use pgexec_bgprocess::detach::{self, Detach, DETACHED_ENV};
use pgexec_bgprocess::executor::{self, ExecutorContext};
use pgexec_bgprocess::observability;

#[derive(Parser, Debug)]
#[command(
    name = "pgexec-executor",
    version,
    about = "Runs a command detached from its launcher and records its output and status"
)]
struct Cli {
    /// Existing directory receiving `status`, `out`, `err` and `log_<pid>`
    #[arg(short = 'o', long, env = "OUTDIR")]
    out_dir: PathBuf,

    /// Process id; a variable of that name, if set, becomes PGPASSWORD
    #[arg(short = 'p', long, env = "PROCID")]
    proc_id: Option<String>,

    /// Set on the re-executed supervisor where fork is unavailable
    #[arg(long, env = DETACHED_ENV, hide = true)]
    detached: bool,

    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.out_dir.is_dir() {
        eprintln!(
            "pgexec-executor: output directory {} does not exist",
            cli.out_dir.display()
        );
        return ExitCode::FAILURE;
    }

    match detach::detach(cli.detached) {
        Ok(Detach::HandedOff) => return ExitCode::SUCCESS,
        Ok(Detach::Detached) => {}
        Err(e) => {
            eprintln!("pgexec-executor: {e}");
            return ExitCode::FAILURE;
        }
    }

    // Nobody reads our stderr from here on; the diagnostic log is all there is.
    if let Err(e) = observability::init_diagnostics(&cli.out_dir) {
        eprintln!("pgexec-executor: diagnostics disabled: {e}");
    }
    if let Err(e) = detach::ignore_termination_signals() {
        warn!("Could not ignore termination signals: {}", e);
    }

    let ctx = ExecutorContext::new(cli.out_dir, cli.proc_id);
    let status = executor::run(&ctx, &cli.command);
    info!(exit_code = ?status.exit_code, "Exiting");
    ExitCode::SUCCESS
}
