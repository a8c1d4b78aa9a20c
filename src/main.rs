//! mfsbackup - back up and restore MFS volume sets.
//!
//! Binary entry point for the command-line interface.

use clap::Parser;
use mfs_backup::cli::{self, Cli, Commands};

fn main() {
    if let Err(err) = run() {
        eprintln!("mfsbackup: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli::init_logging(cli.quiet);
    match cli.command {
        Commands::Backup(args) => cli::backup::run(args, cli.quiet)?,
        Commands::Restore(args) => cli::restore::run(args, cli.quiet)?,
    }
    Ok(())
}
