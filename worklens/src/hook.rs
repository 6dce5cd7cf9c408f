//! worklens-hook - one-shot shell-hook producer
//!
//! Invoked from a shell precmd/postexec hook with the command that just
//! finished. Writes a single NDJSON line to the daemon socket and exits 0
//! no matter what: telemetry must never make a prompt slow or noisy, and
//! a stopped daemon is silently ignored.
//!
//! Typical zsh wiring:
//!
//! ```text
//! precmd() {
//!   worklens-hook --command "$(fc -ln -1)" --exit-code $? --duration $SECONDS
//! }
//! ```

mod transport;

use clap::Parser;
use std::path::PathBuf;
use worklens_core::ingest::WireRecord;

#[derive(Parser)]
#[command(name = "worklens-hook")]
#[command(about = "Report one shell command to the worklens daemon")]
#[command(version)]
struct Args {
    /// The command line that was executed
    #[arg(long)]
    command: String,

    /// Working directory (defaults to the current directory)
    #[arg(long)]
    pwd: Option<PathBuf>,

    /// Exit code of the command
    #[arg(long, default_value_t = 0)]
    exit_code: i32,

    /// Wall-clock duration in seconds
    #[arg(long, default_value_t = 0.0)]
    duration: f64,

    /// Socket path override
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let pwd = args
        .pwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));

    let socket = args.socket.unwrap_or_else(default_socket_path);

    let record = WireRecord::Command {
        command: args.command,
        pwd: pwd.to_string_lossy().to_string(),
        ts: transport::now_epoch(),
        duration: args.duration,
        exit_code: args.exit_code,
    };

    // Fire and forget; a missing daemon is not an error.
    let _ = transport::send_record(&socket, &record);
}

fn default_socket_path() -> PathBuf {
    worklens_core::Config::data_dir().join("worklensd.sock")
}
