use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cidx_daemon::error::CidxError;

/// Per-project code indexing daemon. Keeps semantic and full-text indexes
/// resident in memory and serves them over a local socket.
#[derive(Parser)]
#[command(name = "cidx-daemon", version, about)]
struct Args {
    /// Path to the project's .code-indexer/config.json
    config_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.config_path.exists() {
        eprintln!("ERROR: config file not found: {}", args.config_path.display());
        return ExitCode::FAILURE;
    }
    if !args.config_path.is_file() {
        eprintln!(
            "ERROR: config path is not a file: {}",
            args.config_path.display()
        );
        return ExitCode::FAILURE;
    }

    match cidx_daemon::daemon::run(&args.config_path, args.verbose) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CidxError::SingleInstanceViolation { socket }) => {
            eprintln!("ERROR: daemon already running on {}", socket.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}
