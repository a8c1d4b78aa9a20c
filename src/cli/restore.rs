//! Restore command implementation.

use std::fs::File;
use std::io::Read;

use clap::Args;

use crate::restore::RestoreSession;
use crate::volume::{RawTarget, RestoreTarget};
use crate::{Error, Result};

/// Arguments for the restore command.
#[derive(Args)]
pub struct RestoreArgs {
    /// Input image, or `-` for standard input. Segments of a split image
    /// should be concatenated in order.
    #[arg(short = 'i', value_name = "FILE")]
    pub input: String,

    /// Target devices: primary and optional secondary.
    #[arg(value_name = "DEVICE", num_args = 1..=2, required = true)]
    pub devices: Vec<String>,
}

/// Run the restore command.
pub fn run(args: RestoreArgs, quiet: u8) -> Result<()> {
    let target = RawTarget::open(&args.devices[0], args.devices.get(1).map(String::as_str))?;
    let mut session = RestoreSession::new(target);

    let mut input: Box<dyn Read> = if args.input == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(File::open(&args.input).map_err(Error::Io)?)
    };

    let mut buf = vec![0u8; 64 * 1024];
    let mut started = false;
    loop {
        let n = input.read(&mut buf).map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        session.write(&buf[..n])?;
        if !started && session.info_ready() {
            if quiet < 2 {
                display_restore_info(&session);
            }
            session.start()?;
            started = true;
        }
        if quiet == 0 && started {
            let done = session.percent_done();
            eprint!("\rRestoring {}.{:02}%  ", done / 100, done % 100);
        }
    }
    if quiet == 0 {
        eprintln!();
    }
    session.finish()?;
    if quiet < 2 {
        eprintln!("Restore done!");
    }
    Ok(())
}

fn display_restore_info<T: RestoreTarget>(session: &RestoreSession<T>) {
    let mib = session.nsectors() * 512 / (1024 * 1024);
    eprintln!("Restore size: {mib} MiB");
    eprintln!("Partitions to restore: {}", session.partitions().len());
    if let Some(release) = session.source_release() {
        eprintln!("Source software release: {release}");
    }
}
