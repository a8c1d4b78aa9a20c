//! Backup command implementation.

use std::fs::File;
use std::io::Write;

use clap::Args;

use crate::progress::{media_in_backup, media_tiers, recording_hours, SD_SECTORS_PER_HOUR};
use crate::segment::{kilobytes_to_sectors, SegmentSink, Threshold};
use crate::session::{BackupOptions, BackupSession};
use crate::volume::{RawVolume, VolumeAccess};
use crate::{Error, Result};

/// Arguments for the backup command.
#[derive(Args)]
pub struct BackupArgs {
    /// Output file, or `-` for standard output.
    #[arg(short = 'o', value_name = "FILE")]
    pub output: String,

    /// Compress with zlib level 1 (fastest).
    #[arg(short = '1')]
    pub compress_1: bool,
    #[arg(short = '2', hide_short_help = true)]
    pub compress_2: bool,
    #[arg(short = '3', hide_short_help = true)]
    pub compress_3: bool,
    #[arg(short = '4', hide_short_help = true)]
    pub compress_4: bool,
    #[arg(short = '5', hide_short_help = true)]
    pub compress_5: bool,
    #[arg(short = '6', hide_short_help = true)]
    pub compress_6: bool,
    #[arg(short = '7', hide_short_help = true)]
    pub compress_7: bool,
    #[arg(short = '8', hide_short_help = true)]
    pub compress_8: bool,
    /// Compress with zlib level 9 (smallest).
    #[arg(short = '9')]
    pub compress_9: bool,

    /// Exclude the /var partition.
    #[arg(short = 'v')]
    pub skip_var: bool,

    /// Shrink the image by excluding recording data.
    #[arg(short = 's')]
    pub shrink: bool,

    /// Write the old raw-block image format instead of the piecewise one.
    #[arg(long = "old-format")]
    pub old_format: bool,

    /// Per-segment threshold in sectors.
    #[arg(short = 'f', value_name = "SECTORS")]
    pub thresh_sectors: Option<u64>,

    /// Per-segment threshold in kilobytes.
    #[arg(short = 'l', value_name = "KB")]
    pub thresh_kb: Option<u64>,

    /// No threshold; one output takes the whole image.
    #[arg(short = 'a')]
    pub unlimited: bool,

    /// Account the threshold across all segments instead of per segment.
    #[arg(short = 't')]
    pub total: bool,

    /// Account the threshold against the streamed output bytes.
    #[arg(short = 'T')]
    pub streaming_total: bool,

    /// Source devices: primary and optional secondary.
    #[arg(value_name = "DEVICE", num_args = 1..=2, required = true)]
    pub devices: Vec<String>,
}

impl BackupArgs {
    fn compression(&self) -> Result<Option<u32>> {
        let flags = [
            self.compress_1,
            self.compress_2,
            self.compress_3,
            self.compress_4,
            self.compress_5,
            self.compress_6,
            self.compress_7,
            self.compress_8,
            self.compress_9,
        ];
        let mut level = None;
        for (i, &set) in flags.iter().enumerate() {
            if !set {
                continue;
            }
            if level.is_some() {
                return Err(Error::Config {
                    reason: "only one compression level may be given".into(),
                });
            }
            level = Some(i as u32 + 1);
        }
        Ok(level)
    }

    fn threshold(&self) -> Result<Threshold> {
        let value_flags =
            [self.thresh_sectors.is_some(), self.thresh_kb.is_some(), self.unlimited];
        if value_flags.iter().filter(|&&set| set).count() > 1 {
            return Err(Error::Config {
                reason: "-f, -l and -a are mutually exclusive".into(),
            });
        }
        if self.total && self.streaming_total {
            return Err(Error::Config {
                reason: "-t and -T are mutually exclusive".into(),
            });
        }
        let sectors = match (self.thresh_sectors, self.thresh_kb) {
            (Some(sectors), _) => Some(sectors),
            (None, Some(kb)) => Some(kilobytes_to_sectors(kb)),
            (None, None) => None,
        };
        match sectors {
            None => {
                if self.total || self.streaming_total {
                    return Err(Error::Config {
                        reason: "-t and -T need a threshold value (-f or -l)".into(),
                    });
                }
                Ok(Threshold::Unlimited)
            }
            Some(sectors) if self.streaming_total => Ok(Threshold::StreamingTotal(sectors)),
            Some(sectors) if self.total => Ok(Threshold::CumulativeTotal(sectors)),
            Some(sectors) => Ok(Threshold::PerSegment(sectors)),
        }
    }
}

/// Run the backup command.
pub fn run(args: BackupArgs, quiet: u8) -> Result<()> {
    let threshold = args.threshold()?;
    let compression = args.compression()?;
    if args.output == "-" && matches!(threshold, Threshold::PerSegment(_)) {
        return Err(Error::Config {
            reason: "per-segment output cannot go to standard output".into(),
        });
    }

    let volume = RawVolume::open(&args.devices[0], args.devices.get(1).map(String::as_str))?;
    let options = BackupOptions {
        skip_var: args.skip_var,
        shrink: args.shrink,
        compression,
        threshold,
        kb_threshold: args.thresh_kb.is_some(),
    };
    let mut session = if args.old_format {
        BackupSession::init_v1(volume, &options)?
    } else {
        BackupSession::init_v3(volume, &options)?
    };

    if quiet < 2 {
        display_backup_info(&session, args.shrink);
    }

    let path = args.output.clone();
    let mut sink = SegmentSink::new(threshold, move |segment| {
        if path == "-" {
            return Ok(Box::new(std::io::stdout()) as Box<dyn Write>);
        }
        let name = if segment == 0 { path.clone() } else { format!("{path}.{}", segment + 1) };
        File::create(&name).map(|f| Box::new(f) as Box<dyn Write>)
    });

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = session.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sink.write(&buf[..n])?;
        if quiet == 0 {
            let done = session.percent_done();
            if compression.is_some() {
                let ratio = session.compressed_percent();
                eprint!(
                    "\rBacking up {}.{:02}% ({}.{:02}% of original size)  ",
                    done / 100,
                    done % 100,
                    ratio / 100,
                    ratio % 100
                );
            } else {
                eprint!("\rBacking up {}.{:02}%  ", done / 100, done % 100);
            }
        }
    }
    sink.flush()?;
    if quiet == 0 {
        eprintln!();
    }
    session.finish()?;
    if quiet < 2 {
        eprintln!("Backup done!");
    }
    Ok(())
}

/// Pre-transfer summary, printed to stderr like the progress line.
fn display_backup_info<V: VolumeAccess>(session: &BackupSession<V>, shrink: bool) {
    let mib = session.nsectors() * 512 / (1024 * 1024);
    eprintln!("Uncompressed backup size: {mib} MiB");
    for (i, tier) in media_tiers(&session.volume().zone_extents()).iter().enumerate() {
        let hours = recording_hours(*tier);
        if i == 0 {
            eprintln!("Source drive size is {hours} hours");
        } else {
            eprintln!("        - Upgraded to {hours} hours");
        }
    }
    if shrink {
        eprintln!("Backup will not include any recordings.");
    } else {
        let backed: u64 = session
            .volume()
            .mfs_partitions()
            .iter()
            .map(|p| p.sectors as u64)
            .sum();
        let media = media_in_backup(&session.volume().zone_extents(), backed);
        eprintln!(
            "Backup will include about {} hours of recordings",
            media / SD_SECTORS_PER_HOUR
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> BackupArgs {
        BackupArgs {
            output: "-".into(),
            compress_1: false,
            compress_2: false,
            compress_3: false,
            compress_4: false,
            compress_5: false,
            compress_6: false,
            compress_7: false,
            compress_8: false,
            compress_9: false,
            skip_var: false,
            shrink: false,
            old_format: false,
            thresh_sectors: None,
            thresh_kb: None,
            unlimited: false,
            total: false,
            streaming_total: false,
            devices: vec!["/dev/hda".into()],
        }
    }

    #[test]
    fn threshold_flags_are_pairwise_exclusive() {
        let mut bad = args();
        bad.thresh_sectors = Some(1000);
        bad.unlimited = true;
        assert!(bad.threshold().is_err());

        let mut bad = args();
        bad.thresh_sectors = Some(1000);
        bad.thresh_kb = Some(5);
        assert!(bad.threshold().is_err());

        let mut bad = args();
        bad.total = true;
        bad.streaming_total = true;
        assert!(bad.threshold().is_err());
    }

    #[test]
    fn kilobyte_threshold_converts_to_sectors() {
        let mut a = args();
        a.thresh_kb = Some(3);
        assert_eq!(a.threshold().unwrap(), Threshold::PerSegment(3 * 2048));
    }

    #[test]
    fn total_modes_need_a_value() {
        let mut a = args();
        a.total = true;
        assert!(a.threshold().is_err());

        a.thresh_sectors = Some(100);
        assert_eq!(a.threshold().unwrap(), Threshold::CumulativeTotal(100));

        a.total = false;
        a.streaming_total = true;
        assert_eq!(a.threshold().unwrap(), Threshold::StreamingTotal(100));
    }

    #[test]
    fn only_one_compression_level_is_accepted() {
        let mut a = args();
        a.compress_4 = true;
        assert_eq!(a.compression().unwrap(), Some(4));

        a.compress_9 = true;
        assert!(a.compression().is_err());

        assert_eq!(args().compression().unwrap(), None);
    }
}
