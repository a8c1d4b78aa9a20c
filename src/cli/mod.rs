//! Command-line front ends.

pub mod backup;
pub mod restore;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mfsbackup", version, about = "Back up and restore MFS volume sets")]
pub struct Cli {
    /// Less console output; repeat to silence the pre-transfer summary too.
    #[arg(short = 'q', action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a volume set into a backup image.
    Backup(backup::BackupArgs),
    /// Write a backup image onto a target volume set.
    Restore(restore::RestoreArgs),
}

/// Initialize logging from the quiet level. `RUST_LOG` overrides it.
pub fn init_logging(quiet: u8) {
    let default = match quiet {
        0 => "info",
        1 => "warn",
        _ => "error",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
