//! Backup session lifecycle.
//!
//! A session is created by a format-specific initializer that runs the scan
//! phase up front: it enumerates everything the image will carry, fixes the
//! uncompressed image size, and leaves the state machine parked at the first
//! state. The driver in `backup` then mutates the session incrementally, and
//! an explicit [`BackupSession::finish`] call closes it, safe to call on a
//! partially advanced session.

use tracing::{debug, info, warn};

use crate::checksum::StreamCrc;
use crate::compress::StreamCompressor;
use crate::device::SECTOR_SIZE;
use crate::format::{
    set_compression, BlockDesc, ExtraInfo, Format, HeaderV1, HeaderV3, PartitionDesc,
    ZoneMapDesc, BF_64, BF_BACKUPVAR, BF_FLAGS, BF_NOBSWAP, BF_SHRINK, BF_THRESHSIZE,
    BF_TRUNCATED,
};
use crate::progress;
use crate::segment::Threshold;
use crate::state::BackupState;
use crate::volume::{VolumeAccess, VolumeGeometry};
use crate::{Error, Result, StreamError};

/// Options fixed before a backup session starts.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Exclude the variable-data partition from the image.
    pub skip_var: bool,
    /// Exclude media (recording) data, producing an application-only image.
    pub shrink: bool,
    /// zlib level 1..=9; `None` writes an uncompressed image.
    pub compression: Option<u32>,
    /// Segmentation mode, recorded in the image flags.
    pub threshold: Threshold,
    /// The threshold was given in kilobytes rather than sectors.
    pub kb_threshold: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            skip_var: false,
            shrink: false,
            compression: None,
            threshold: Threshold::Unlimited,
            kb_threshold: false,
        }
    }
}

/// One backup in progress over a source volume set.
pub struct BackupSession<V> {
    pub(crate) volume: V,
    pub(crate) format: Format,
    pub(crate) flags: u32,
    pub(crate) state: BackupState,
    pub(crate) geometry: VolumeGeometry,

    pub(crate) parts: Vec<PartitionDesc>,
    pub(crate) blocks: Vec<BlockDesc>,
    pub(crate) mfsparts: Vec<PartitionDesc>,
    pub(crate) zonemaps: Vec<ZoneMapDesc>,
    /// Occupied inode slots, in table order.
    pub(crate) inodes: Vec<u32>,
    pub(crate) extra: Vec<ExtraInfo>,
    pub(crate) ilogtype: u32,

    pub(crate) appsectors: u64,
    pub(crate) mediasectors: u64,
    pub(crate) appinodes: u32,
    pub(crate) mediainodes: u32,

    /// Byte cursor inside the packed info region, consumed by the
    /// zero-padding at its end. The only value carried across info states.
    pub(crate) info_block_off: usize,
    pub(crate) nsectors: u64,
    /// Logical (pre-compression) bytes produced so far.
    pub(crate) raw_bytes: u64,
    /// Bytes actually handed to the caller.
    pub(crate) stream_bytes: u64,

    pub(crate) crc: StreamCrc,
    pub(crate) compressor: Option<StreamCompressor>,
    pub(crate) pending: Vec<u8>,
    pub(crate) pending_pos: usize,
    /// First stream fault; once set, every later driver call returns it.
    pub(crate) error: Option<StreamError>,
}

impl<V: VolumeAccess> BackupSession<V> {
    /// Start a session writing the raw-block image format.
    pub fn init_v1(volume: V, options: &BackupOptions) -> Result<Self> {
        Self::init(volume, Format::V1, options)
    }

    /// Start a session writing the piecewise filesystem image format.
    pub fn init_v3(volume: V, options: &BackupOptions) -> Result<Self> {
        Self::init(volume, Format::V3, options)
    }

    fn init(mut volume: V, format: Format, options: &BackupOptions) -> Result<Self> {
        if options.shrink && format == Format::V1 {
            return Err(Error::Config {
                reason: "shrink backups require the piecewise image format".into(),
            });
        }

        let mut flags = options.threshold.flag_bits();
        if options.kb_threshold {
            flags |= BF_THRESHSIZE;
        }
        if !options.skip_var {
            flags |= BF_BACKUPVAR;
        }
        if options.shrink {
            flags |= BF_SHRINK;
        }
        if let Some(level) = options.compression {
            if !(1..=9).contains(&level) {
                return Err(Error::Config {
                    reason: format!("compression level {level} out of range"),
                });
            }
            flags |= set_compression(level);
        }
        if volume.is_64bit() {
            flags |= BF_64;
        }
        if !volume.byte_swapped() {
            flags |= BF_NOBSWAP;
        }

        let parts: Vec<PartitionDesc> = volume
            .partitions()
            .into_iter()
            .filter(|p| !p.is_var || flags & BF_BACKUPVAR != 0)
            .map(|p| p.desc)
            .collect();
        let mfsparts = volume.mfs_partitions();
        let geometry = volume.geometry();

        // The volume set may claim more sectors than its partitions hold
        // when the drive was copied to smaller media. Record that in the
        // image so restore knows the tail is absent.
        let present: u64 = mfsparts.iter().map(|p| p.sectors as u64).sum();
        if present < geometry.total_sectors {
            warn!(
                claimed = geometry.total_sectors,
                present, "volume set exceeds its partitions; marking image truncated"
            );
            flags |= BF_TRUNCATED;
        }

        let mut blocks = Vec::new();
        let mut zonemaps = Vec::new();
        let mut inodes = Vec::new();
        let (mut appsectors, mut mediasectors) = (0u64, 0u64);
        let (mut appinodes, mut mediainodes) = (0u32, 0u32);
        match format {
            Format::V1 => blocks = volume.mfs_blocks(),
            Format::V3 => {
                zonemaps = volume.zone_maps();
                for slot in 0..volume.inode_count() {
                    let Some(header) = volume.read_inode(slot)? else {
                        continue;
                    };
                    let sectors = header.backed_sectors(flags);
                    if header.is_media() {
                        mediainodes += 1;
                        mediasectors += sectors;
                    } else {
                        appinodes += 1;
                        appsectors += sectors;
                    }
                    inodes.push(slot);
                }
            }
        }

        let mut extra = Vec::new();
        if let Some(release) = volume.source_release() {
            extra.push(ExtraInfo::string(&release));
        }
        let ilogtype = volume.ilogtype();

        // The uncompressed image size is fixed here, before the first byte
        // is produced: header sector, packed info region, boot block,
        // partition bodies, the filesystem body, and the trailer.
        let extrasize: usize = extra.iter().map(|e| e.encoded_len()).sum();
        let mut info_bytes = (parts.len() + mfsparts.len()) * PartitionDesc::SIZE + extrasize;
        match format {
            Format::V1 => info_bytes += blocks.len() * BlockDesc::SIZE,
            Format::V3 => info_bytes += zonemaps.len() * ZoneMapDesc::SIZE,
        }
        let part_sectors: u64 = parts.iter().map(|p| p.sectors as u64).sum();
        let body_sectors = match format {
            Format::V1 => blocks.iter().map(|b| b.sectors as u64).sum(),
            Format::V3 => {
                1 + geometry.lognsectors as u64
                    + geometry.unknsectors as u64
                    + inodes.len() as u64
                    + appsectors
                    + mediasectors
            }
        };
        let nsectors =
            1 + info_bytes.div_ceil(SECTOR_SIZE) as u64 + 1 + part_sectors + body_sectors + 1;

        info!(
            ?format,
            nsectors,
            nparts = parts.len(),
            mfspairs = mfsparts.len(),
            ninodes = inodes.len(),
            "backup session initialized"
        );
        debug!(flags = format_args!("{flags:#010x}"), "session flags");

        Ok(Self {
            volume,
            format,
            flags,
            state: BackupState::default(),
            geometry,
            parts,
            blocks,
            mfsparts,
            zonemaps,
            inodes,
            extra,
            ilogtype,
            appsectors,
            mediasectors,
            appinodes,
            mediainodes,
            info_block_off: 0,
            nsectors,
            raw_bytes: 0,
            stream_bytes: 0,
            crc: StreamCrc::new(),
            compressor: options.compression.map(StreamCompressor::new),
            pending: Vec::new(),
            pending_pos: 0,
            error: None,
        })
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Image flags, low 16 bits as they appear in the header.
    pub fn flags(&self) -> u32 {
        self.flags & BF_FLAGS
    }

    /// Uncompressed image size in sectors.
    pub fn nsectors(&self) -> u64 {
        self.nsectors
    }

    /// Logical sector the stream has reached. Monotonic, never past
    /// `nsectors`.
    pub fn cursector(&self) -> u64 {
        self.raw_bytes / SECTOR_SIZE as u64
    }

    /// Completion in hundredths of a percent.
    pub fn percent_done(&self) -> u32 {
        progress::percent(self.cursector() as u32, self.nsectors as u32)
    }

    /// Output bytes as hundredths of a percent of logical bytes. Below
    /// 10000 when compression is saving space.
    pub fn compressed_percent(&self) -> u32 {
        progress::percent(
            (self.stream_bytes / SECTOR_SIZE as u64) as u32,
            self.cursector() as u32,
        )
    }

    pub(crate) fn header_v1(&self) -> HeaderV1 {
        HeaderV1 {
            flags: self.flags & BF_FLAGS,
            nsectors: self.nsectors as u32,
            nparts: self.parts.len() as u32,
            nblocks: self.blocks.len() as u32,
            mfspairs: self.mfsparts.len() as u32,
        }
    }

    pub(crate) fn header_v3(&self) -> HeaderV3 {
        HeaderV3 {
            flags: (self.flags & BF_FLAGS) as u16,
            nparts: self.parts.len() as u16,
            nzones: self.zonemaps.len() as u16,
            mfspairs: self.mfsparts.len() as u16,
            ninodes: self.inodes.len() as u32,
            ilogtype: self.ilogtype,
            nsectors: self.nsectors,
            appsectors: self.appsectors,
            mediasectors: self.mediasectors,
            appinodes: self.appinodes,
            mediainodes: self.mediainodes,
            nextra: self.extra.len() as u32,
            extrasize: self.extra.iter().map(|e| e.encoded_len()).sum::<usize>() as u32,
        }
    }

    /// Close the session, releasing the volume. Safe on a partially
    /// advanced session; reports the latched fault if one occurred.
    pub fn finish(self) -> Result<()> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        debug!(sectors = self.cursector(), "backup session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{compression_level, BF_COMPRESSED, TY_FILE};
    use crate::synthetic::{InodeSpec, SyntheticVolume};

    fn small_volume() -> SyntheticVolume {
        SyntheticVolume::builder()
            .boot_block(0xaa)
            .partition(0, 2, 4, false)
            .partition(0, 9, 2, true)
            .inode(InodeSpec::file(100, vec![1; 1500]))
            .inode(InodeSpec::stream(200, vec![2; 4096]))
            .release("7.2.2-oth-K1")
            .build()
    }

    #[test]
    fn scan_fixes_size_before_first_read() {
        let session =
            BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        // header + info + boot + partitions (4 + 2) + volume header + log(8)
        // + unk(4) + 2 inode sectors + 3 app data + 8 media data + trailer
        let info_bytes = 2 * 8 + 2 * 8 + 3 * 24 + session.extra[0].encoded_len();
        assert_eq!(info_bytes.div_ceil(SECTOR_SIZE), 1);
        assert_eq!(session.nsectors(), 1 + 1 + 1 + 6 + 1 + 8 + 4 + 2 + 3 + 8 + 1);
        assert_eq!(session.cursector(), 0);
        assert_eq!(session.percent_done(), 0);
    }

    #[test]
    fn var_partition_is_excluded_on_request() {
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions { skip_var: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(session.flags() & BF_BACKUPVAR, 0);
        assert_eq!(session.parts.len(), 1);
        assert_eq!(session.parts[0].partno, 2);

        let full = BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        assert_ne!(full.flags() & BF_BACKUPVAR, 0);
        assert_eq!(full.parts.len(), 2);
    }

    #[test]
    fn shrink_drops_media_data_from_accounting() {
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions { shrink: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(session.mediasectors, 0);
        assert_eq!(session.mediainodes, 1);
        assert_eq!(session.appsectors, 3);
        let full = BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        assert_eq!(full.nsectors() - session.nsectors(), 8);
    }

    #[test]
    fn shrink_needs_the_piecewise_format() {
        let result = BackupSession::init_v1(
            small_volume(),
            &BackupOptions { shrink: true, ..Default::default() },
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn compression_level_lands_in_the_flags() {
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions { compression: Some(7), ..Default::default() },
        )
        .unwrap();
        assert_ne!(session.flags() & BF_COMPRESSED, 0);
        assert_eq!(compression_level(session.flags()), 7);

        let bad = BackupSession::init_v3(
            small_volume(),
            &BackupOptions { compression: Some(12), ..Default::default() },
        );
        assert!(matches!(bad, Err(Error::Config { .. })));
    }

    #[test]
    fn threshold_flags_track_units_and_accounting() {
        use crate::format::{BF_STREAMTOT, BF_THRESHTOT};

        // A sector-valued per-segment cap sets no flag at all.
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions {
                threshold: Threshold::PerSegment(20),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            session.flags() & (BF_THRESHSIZE | BF_THRESHTOT | BF_STREAMTOT),
            0
        );

        // The kilobyte form of the same cap records only the unit.
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions {
                threshold: Threshold::PerSegment(40960),
                kb_threshold: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            session.flags() & (BF_THRESHSIZE | BF_THRESHTOT | BF_STREAMTOT),
            BF_THRESHSIZE
        );

        // Totals modes record their accounting bit, nothing more.
        let session = BackupSession::init_v3(
            small_volume(),
            &BackupOptions {
                threshold: Threshold::CumulativeTotal(1 << 20),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            session.flags() & (BF_THRESHSIZE | BF_THRESHTOT | BF_STREAMTOT),
            BF_THRESHTOT
        );
    }

    #[test]
    fn v1_scan_collects_block_ranges() {
        let session =
            BackupSession::init_v1(small_volume(), &BackupOptions::default()).unwrap();
        assert_eq!(session.blocks.len(), 2);
        let covered: u64 = session.blocks.iter().map(|b| b.sectors as u64).sum();
        assert_eq!(covered, session.geometry.total_sectors);
        assert!(session.inodes.is_empty());
    }

    #[test]
    fn release_string_becomes_extra_info() {
        let session =
            BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        assert_eq!(session.extra.len(), 1);
        assert_eq!(session.extra[0].payload, b"7.2.2-oth-K1");
        assert_eq!(session.header_v3().nextra, 1);
    }

    #[test]
    fn headers_reflect_the_scan() {
        let session =
            BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        let header = session.header_v3();
        assert_eq!(header.nparts, 2);
        assert_eq!(header.nzones, 3);
        assert_eq!(header.mfspairs, 2);
        assert_eq!(header.ninodes, 2);
        assert_eq!(header.appinodes, 1);
        assert_eq!(header.mediainodes, 1);
        assert_eq!(header.nsectors, session.nsectors());

        let v1 = BackupSession::init_v1(small_volume(), &BackupOptions::default()).unwrap();
        let header = v1.header_v1();
        assert_eq!(header.nblocks, 2);
        assert_eq!(header.mfspairs, 2);
    }

    #[test]
    fn finish_is_clean_on_an_unstarted_session() {
        let session =
            BackupSession::init_v3(small_volume(), &BackupOptions::default()).unwrap();
        session.finish().unwrap();
    }

    // Session init must not be confused by inode slots that are present
    // but inline-only.
    #[test]
    fn inline_inode_contributes_no_data_sectors() {
        let volume = SyntheticVolume::builder()
            .inode(InodeSpec { fsid: 5, fstype: TY_FILE, data: vec![9; 100], inline: true })
            .build();
        let session = BackupSession::init_v3(volume, &BackupOptions::default()).unwrap();
        assert_eq!(session.appinodes, 1);
        assert_eq!(session.appsectors, 0);
    }
}
