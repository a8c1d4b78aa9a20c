//! On-wire backup image format.
//!
//! A backup image is a sequence of 512-byte-aligned regions: a magic-tagged
//! header, the packed description lists, the boot block, raw partition
//! bodies, the filesystem body, and a trailing checksum block. Two format
//! versions exist: V1 images carry raw MFS block ranges, V3 images carry the
//! filesystem piecewise (volume header, transaction log, inodes).
//!
//! All multi-byte fields are written big-endian. Each magic is defined with
//! both its native and byte-swapped constant so a reader can detect an image
//! written by an opposite-endian host and flip its field decoding.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::device::SECTOR_SIZE;
use crate::{Result, StreamError};

/// V1 image magic (`TBAK`).
pub const TB_MAGIC: u32 = u32::from_be_bytes(*b"TBAK");
/// V1 magic as seen through a byte-swapped read.
pub const TB_ENDIAN: u32 = TB_MAGIC.swap_bytes();
/// V3 image magic (`TBK3`).
pub const TB3_MAGIC: u32 = u32::from_be_bytes(*b"TBK3");
/// V3 magic as seen through a byte-swapped read.
pub const TB3_ENDIAN: u32 = TB3_MAGIC.swap_bytes();

// Backup semantics live in the low 16 flag bits and travel in the image.
pub const BF_COMPRESSED: u32 = 0x0000_0001;
pub const BF_MFSONLY: u32 = 0x0000_0002;
pub const BF_BACKUPVAR: u32 = 0x0000_0004;
pub const BF_SHRINK: u32 = 0x0000_0008;
pub const BF_THRESHSIZE: u32 = 0x0000_0010;
pub const BF_THRESHTOT: u32 = 0x0000_0020;
pub const BF_STREAMTOT: u32 = 0x0000_0040;
pub const BF_NOBSWAP: u32 = 0x0000_0080;
pub const BF_TRUNCATED: u32 = 0x0000_0100;
pub const BF_64: u32 = 0x0000_0200;
pub const BF_FLAGS: u32 = 0x0000_ffff;

// Restore-session bookkeeping lives in the high 16 bits and never travels.
pub const RF_INITIALIZED: u32 = 0x0001_0000;
pub const RF_ENDIAN: u32 = 0x0002_0000;
pub const RF_NOMORECOMP: u32 = 0x0004_0000;
pub const RF_ZEROPART: u32 = 0x0008_0000;
pub const RF_FLAGS: u32 = 0xffff_0000;

/// Extract the compression level (1..=9, 0 = uncompressed) from the flags.
pub fn compression_level(flags: u32) -> u32 {
    (flags >> 12) & 0xf
}

/// Encode a compression level into the flags, implying [`BF_COMPRESSED`].
pub fn set_compression(level: u32) -> u32 {
    ((level & 0xf) << 12) | BF_COMPRESSED
}

/// On-disk format version of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    V1,
    V3,
}

/// Endianness of the host that wrote the image, as detected from the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endian {
    pub swapped: bool,
}

impl Endian {
    pub fn read_u16(&self, buf: &[u8]) -> u16 {
        if self.swapped {
            LittleEndian::read_u16(buf)
        } else {
            BigEndian::read_u16(buf)
        }
    }

    pub fn read_u32(&self, buf: &[u8]) -> u32 {
        if self.swapped {
            LittleEndian::read_u32(buf)
        } else {
            BigEndian::read_u32(buf)
        }
    }

    pub fn read_u64(&self, buf: &[u8]) -> u64 {
        if self.swapped {
            LittleEndian::read_u64(buf)
        } else {
            BigEndian::read_u64(buf)
        }
    }
}

/// V1 header record: a fixed 512-byte block opening the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderV1 {
    pub flags: u32,
    /// Uncompressed image size in sectors.
    pub nsectors: u32,
    /// Number of non-MFS partitions backed up.
    pub nparts: u32,
    /// Number of raw MFS block ranges backed up.
    pub nblocks: u32,
    /// Number of MFS volume pairs found.
    pub mfspairs: u32,
}

impl HeaderV1 {
    /// Encoded size. V1 headers fill a whole sector by themselves.
    pub const SIZE: usize = SECTOR_SIZE;

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::SIZE, 0);
        let buf = &mut out[start..];
        BigEndian::write_u32(&mut buf[0..], TB_MAGIC);
        BigEndian::write_u32(&mut buf[4..], self.flags & BF_FLAGS);
        BigEndian::write_u32(&mut buf[8..], self.nsectors);
        BigEndian::write_u32(&mut buf[12..], self.nparts);
        BigEndian::write_u32(&mut buf[16..], self.nblocks);
        BigEndian::write_u32(&mut buf[20..], self.mfspairs);
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            flags: endian.read_u32(&buf[4..]) & BF_FLAGS,
            nsectors: endian.read_u32(&buf[8..]),
            nparts: endian.read_u32(&buf[12..]),
            nblocks: endian.read_u32(&buf[16..]),
            mfspairs: endian.read_u32(&buf[20..]),
        }
    }
}

/// V3 header record. Unlike V1 it does not fill a sector; the description
/// lists follow immediately after it within the packed info region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderV3 {
    pub flags: u16,
    pub nparts: u16,
    pub nzones: u16,
    pub mfspairs: u16,
    pub ninodes: u32,
    /// Type of inode update log entries to replay on restore.
    pub ilogtype: u32,
    pub nsectors: u64,
    pub appsectors: u64,
    pub mediasectors: u64,
    pub appinodes: u32,
    pub mediainodes: u32,
    pub nextra: u32,
    pub extrasize: u32,
}

impl HeaderV3 {
    /// Encoded size, already a multiple of 8.
    pub const SIZE: usize = 64;

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::SIZE, 0);
        let buf = &mut out[start..];
        BigEndian::write_u32(&mut buf[0..], TB3_MAGIC);
        BigEndian::write_u32(&mut buf[4..], Self::SIZE as u32);
        BigEndian::write_u16(&mut buf[8..], self.flags);
        BigEndian::write_u16(&mut buf[10..], self.nparts);
        BigEndian::write_u16(&mut buf[12..], self.nzones);
        BigEndian::write_u16(&mut buf[14..], self.mfspairs);
        BigEndian::write_u32(&mut buf[16..], self.ninodes);
        BigEndian::write_u32(&mut buf[20..], self.ilogtype);
        BigEndian::write_u64(&mut buf[24..], self.nsectors);
        BigEndian::write_u64(&mut buf[32..], self.appsectors);
        BigEndian::write_u64(&mut buf[40..], self.mediasectors);
        BigEndian::write_u32(&mut buf[48..], self.appinodes);
        BigEndian::write_u32(&mut buf[52..], self.mediainodes);
        BigEndian::write_u32(&mut buf[56..], self.nextra);
        BigEndian::write_u32(&mut buf[60..], self.extrasize);
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            flags: endian.read_u16(&buf[8..]),
            nparts: endian.read_u16(&buf[10..]),
            nzones: endian.read_u16(&buf[12..]),
            mfspairs: endian.read_u16(&buf[14..]),
            ninodes: endian.read_u32(&buf[16..]),
            ilogtype: endian.read_u32(&buf[20..]),
            nsectors: endian.read_u64(&buf[24..]),
            appsectors: endian.read_u64(&buf[32..]),
            mediasectors: endian.read_u64(&buf[40..]),
            appinodes: endian.read_u32(&buf[48..]),
            mediainodes: endian.read_u32(&buf[52..]),
            nextra: endian.read_u32(&buf[56..]),
            extrasize: endian.read_u32(&buf[60..]),
        }
    }
}

/// Detect the format and source endianness of an image from its first word.
pub fn detect_magic(buf: &[u8]) -> Result<(Format, Endian)> {
    let magic = BigEndian::read_u32(buf);
    match magic {
        TB_MAGIC => Ok((Format::V1, Endian { swapped: false })),
        TB_ENDIAN => Ok((Format::V1, Endian { swapped: true })),
        TB3_MAGIC => Ok((Format::V3, Endian { swapped: false })),
        TB3_ENDIAN => Ok((Format::V3, Endian { swapped: true })),
        _ => Err(StreamError::BadMagic { magic }.into()),
    }
}

/// One backed-up raw partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionDesc {
    pub sectors: u32,
    pub partno: u8,
    pub devno: u8,
}

impl PartitionDesc {
    pub const SIZE: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::SIZE, 0);
        BigEndian::write_u32(&mut out[start..], self.sectors);
        out[start + 4] = self.partno;
        out[start + 5] = self.devno;
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            sectors: endian.read_u32(buf),
            partno: buf[4],
            devno: buf[5],
        }
    }
}

/// One contiguous range of raw MFS data (V1 images only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDesc {
    pub firstsector: u32,
    pub sectors: u32,
}

impl BlockDesc {
    pub const SIZE: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::SIZE, 0);
        BigEndian::write_u32(&mut out[start..], self.firstsector);
        BigEndian::write_u32(&mut out[start + 4..], self.sectors);
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            firstsector: endian.read_u32(buf),
            sectors: endian.read_u32(&buf[4..]),
        }
    }
}

/// Zone types as stored in zone map headers.
pub const ZONE_INODE: u32 = 0;
pub const ZONE_APPLICATION: u32 = 1;
pub const ZONE_MEDIA: u32 = 2;

/// One zone map to recreate on restore (V3 images only).
///
/// `fsmem_base` is the zone's base memory address on the source firmware; it
/// is carried opaquely so the restored volume loads at the same address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneMapDesc {
    pub map_length: u32,
    pub zone_type: u32,
    pub fsmem_base: u32,
    pub min_au: u32,
    pub size: u64,
}

impl ZoneMapDesc {
    pub const SIZE: usize = 24;

    pub fn is_media(&self) -> bool {
        self.zone_type == ZONE_MEDIA
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::SIZE, 0);
        let buf = &mut out[start..];
        BigEndian::write_u32(&mut buf[0..], self.map_length);
        BigEndian::write_u32(&mut buf[4..], self.zone_type);
        BigEndian::write_u32(&mut buf[8..], self.fsmem_base);
        BigEndian::write_u32(&mut buf[12..], self.min_au);
        BigEndian::write_u64(&mut buf[16..], self.size);
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            map_length: endian.read_u32(buf),
            zone_type: endian.read_u32(&buf[4..]),
            fsmem_base: endian.read_u32(&buf[8..]),
            min_au: endian.read_u32(&buf[12..]),
            size: endian.read_u64(&buf[16..]),
        }
    }
}

/// Extra-info payload datatype for plain strings.
pub const EI_STRING: u8 = 0;

/// Forward-compatible metadata record appended to an image.
///
/// Only the `(typelength, datatype, datalength)` header is interpreted; the
/// payload is opaque bytes. `typelength` is the whole record length in
/// 32-bit words, so records can be skipped without knowing their datatype.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub datatype: u8,
    pub payload: Vec<u8>,
}

impl ExtraInfo {
    pub const HEADER_SIZE: usize = 4;

    pub fn string(value: &str) -> Self {
        Self {
            datatype: EI_STRING,
            payload: value.as_bytes().to_vec(),
        }
    }

    /// Encoded record size, padded to a 4-byte boundary.
    pub fn encoded_len(&self) -> usize {
        (Self::HEADER_SIZE + self.payload.len() + 3) & !3
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let len = self.encoded_len();
        debug_assert!(len / 4 <= u8::MAX as usize, "extra-info record too long");
        let start = out.len();
        out.resize(start + len, 0);
        let buf = &mut out[start..];
        buf[0] = (len / 4) as u8;
        buf[1] = self.datatype;
        BigEndian::write_u16(&mut buf[2..], self.payload.len() as u16);
        buf[4..4 + self.payload.len()].copy_from_slice(&self.payload);
    }

    /// Decode one record, returning it and its encoded length.
    pub fn decode(buf: &[u8], endian: Endian) -> Result<(Self, usize)> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(StreamError::Truncated { state: "InfoExtra" }.into());
        }
        let len = buf[0] as usize * 4;
        let datalength = endian.read_u16(&buf[2..]) as usize;
        if len < Self::HEADER_SIZE + datalength || buf.len() < len {
            return Err(StreamError::Truncated { state: "InfoExtra" }.into());
        }
        Ok((
            Self {
                datatype: buf[1],
                payload: buf[4..4 + datalength].to_vec(),
            },
            len,
        ))
    }
}

/// Signature word of an inode metadata sector.
pub const INODE_SIG: u32 = 0x9123_1EBC;
/// More than one fsid hashes to this inode; the chain continues.
pub const INODE_CHAINED: u32 = 0x8000_0000;
/// The inode's data lives inside the metadata sector itself.
pub const INODE_DATA: u32 = 0x4000_0000;

/// Filesystem object types.
pub const TY_FILE: u8 = 1;
pub const TY_STREAM: u8 = 2;
pub const TY_DIR: u8 = 4;
pub const TY_DB: u8 = 8;

/// Extent records that fit in one metadata sector after the fixed fields.
pub const MAX_EXTENTS: usize = (SECTOR_SIZE - 60) / 8;

/// One extent of inode data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataExtent {
    pub sector: u32,
    pub count: u32,
}

/// An inode metadata record as stored in its 512-byte sector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeHeader {
    pub fsid: u32,
    pub refcount: u32,
    pub bootcycles: u32,
    pub bootsecs: u32,
    pub inode: u32,
    pub unk3: u32,
    pub size: u32,
    pub blocksize: u32,
    pub blockused: u32,
    pub lastmodified: u32,
    pub fstype: u8,
    pub zone: u8,
    pub inode_flags: u32,
    pub extents: Vec<DataExtent>,
}

impl InodeHeader {
    /// Whether this inode holds recording (media stream) data.
    pub fn is_media(&self) -> bool {
        self.fstype == TY_STREAM
    }

    /// Number of data sectors that follow the metadata sector in an image
    /// produced with `flags`. Inline data never leaves the metadata sector,
    /// and shrink images exclude media stream data.
    pub fn backed_sectors(&self, flags: u32) -> u64 {
        if self.inode_flags & INODE_DATA != 0 {
            return 0;
        }
        if flags & BF_SHRINK != 0 && self.is_media() {
            return 0;
        }
        self.extents.iter().map(|e| e.count as u64).sum()
    }

    /// Encode into one 512-byte sector, computing the checksum field.
    pub fn encode_sector(&self) -> [u8; SECTOR_SIZE] {
        debug_assert!(
            self.extents.len() <= MAX_EXTENTS,
            "extent list does not fit the sector"
        );
        let mut buf = [0u8; SECTOR_SIZE];
        BigEndian::write_u32(&mut buf[0..], self.fsid);
        BigEndian::write_u32(&mut buf[4..], self.refcount);
        BigEndian::write_u32(&mut buf[8..], self.bootcycles);
        BigEndian::write_u32(&mut buf[12..], self.bootsecs);
        BigEndian::write_u32(&mut buf[16..], self.inode);
        BigEndian::write_u32(&mut buf[20..], self.unk3);
        BigEndian::write_u32(&mut buf[24..], self.size);
        BigEndian::write_u32(&mut buf[28..], self.blocksize);
        BigEndian::write_u32(&mut buf[32..], self.blockused);
        BigEndian::write_u32(&mut buf[36..], self.lastmodified);
        buf[40] = self.fstype;
        buf[41] = self.zone;
        BigEndian::write_u32(&mut buf[44..], INODE_SIG);
        BigEndian::write_u32(&mut buf[52..], self.inode_flags);
        BigEndian::write_u32(&mut buf[56..], self.extents.len() as u32);
        let mut off = 60;
        for extent in &self.extents {
            BigEndian::write_u32(&mut buf[off..], extent.sector);
            BigEndian::write_u32(&mut buf[off + 4..], extent.count);
            off += 8;
        }
        let crc = sector_checksum(&buf);
        BigEndian::write_u32(&mut buf[48..], crc);
        buf
    }

    /// Decode an inode metadata sector, verifying signature and checksum.
    pub fn decode_sector(buf: &[u8], endian: Endian) -> Result<Self> {
        debug_assert!(buf.len() >= SECTOR_SIZE);
        let sig = endian.read_u32(&buf[44..]);
        if sig != INODE_SIG {
            return Err(StreamError::BadMagic { magic: sig }.into());
        }
        let stored = endian.read_u32(&buf[48..]);
        let mut scratch = [0u8; SECTOR_SIZE];
        scratch.copy_from_slice(&buf[..SECTOR_SIZE]);
        scratch[48..52].fill(0);
        // The wire bytes are the same regardless of the writer's byte order;
        // only the stored field needs order-aware reading.
        let computed = sector_checksum(&scratch);
        if stored != computed {
            return Err(StreamError::BadChecksum { got: stored }.into());
        }
        let numblocks = endian.read_u32(&buf[56..]) as usize;
        // The count is wire data; a sector can carry at most MAX_EXTENTS
        // records, checksum or not.
        if numblocks > MAX_EXTENTS {
            return Err(StreamError::ExtentCount {
                count: numblocks as u32,
                limit: MAX_EXTENTS as u32,
            }
            .into());
        }
        let mut extents = Vec::with_capacity(numblocks);
        let mut off = 60;
        for _ in 0..numblocks {
            extents.push(DataExtent {
                sector: endian.read_u32(&buf[off..]),
                count: endian.read_u32(&buf[off + 4..]),
            });
            off += 8;
        }
        Ok(Self {
            fsid: endian.read_u32(&buf[0..]),
            refcount: endian.read_u32(&buf[4..]),
            bootcycles: endian.read_u32(&buf[8..]),
            bootsecs: endian.read_u32(&buf[12..]),
            inode: endian.read_u32(&buf[16..]),
            unk3: endian.read_u32(&buf[20..]),
            size: endian.read_u32(&buf[24..]),
            blocksize: endian.read_u32(&buf[28..]),
            blockused: endian.read_u32(&buf[32..]),
            lastmodified: endian.read_u32(&buf[36..]),
            fstype: buf[40],
            zone: buf[41],
            inode_flags: endian.read_u32(&buf[52..]),
            extents,
        })
    }
}

/// Checksum of one metadata sector with its checksum field zeroed.
pub fn sector_checksum(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}
