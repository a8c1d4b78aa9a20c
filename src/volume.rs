//! Volume Access Layer interface.
//!
//! The engine never touches MFS internals directly; it consumes the
//! [`VolumeAccess`] trait on backup and the [`RestoreTarget`] trait on
//! restore. [`RawVolume`] implements the source side over raw devices, and
//! `synthetic` provides in-memory implementations of both sides for tests
//! and round-trip verification.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::device::{BlockDevice, FileDevice, SECTOR_SIZE};
use crate::format::{BlockDesc, InodeHeader, PartitionDesc, ZoneMapDesc, ZONE_INODE};
use crate::{Error, Result, StreamError};

/// MFS volume signature.
pub const MFS_MAGIC: u32 = 0xabba_feed;

/// Placement of the regions a V3 image carries piecewise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeGeometry {
    /// Total size of the volume set in sectors.
    pub total_sectors: u64,
    /// Transaction (redo) log placement.
    pub logstart: u64,
    pub lognsectors: u32,
    /// The region the volume header references but the filesystem never
    /// names. Carried verbatim.
    pub unkstart: u64,
    pub unknsectors: u32,
    /// First zone map in the chain.
    pub zonemap_start: u64,
}

/// One contiguous zone extent, used for the recording-hours estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneExtent {
    pub zone_type: u32,
    pub first: u64,
    pub size: u64,
}

/// A non-MFS partition eligible for backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePartition {
    pub desc: PartitionDesc,
    /// The variable-data partition, excluded by the `-v` option.
    pub is_var: bool,
}

/// Read access to a source volume set: enumeration plus raw sector reads.
///
/// One implementation owns both devices of a primary/secondary pair for the
/// life of the session.
pub trait VolumeAccess {
    /// Size of device `devno` in sectors, if the device is present.
    fn device_sectors(&self, devno: u8) -> Option<u64>;

    /// Non-MFS partitions eligible for backup.
    fn partitions(&self) -> Vec<SourcePartition>;

    /// MFS application/media partitions, in volume order.
    fn mfs_partitions(&self) -> Vec<PartitionDesc>;

    /// Sector 0 of the primary device.
    fn read_boot_block(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read from a partition body by partition-relative sector offset.
    fn read_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Read by MFS volume address.
    fn read_mfs(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    fn geometry(&self) -> VolumeGeometry;

    /// Contiguous ranges covering all MFS data (V1 images).
    fn mfs_blocks(&self) -> Vec<BlockDesc>;

    /// Zone map descriptors (V3 images).
    fn zone_maps(&self) -> Vec<ZoneMapDesc>;

    /// Zone extents in map order, for size estimation.
    fn zone_extents(&self) -> Vec<ZoneExtent>;

    /// Number of inode slots in the inode zone.
    fn inode_count(&self) -> u32;

    /// Read and decode one inode. `None` for an unused slot.
    fn read_inode(&mut self, inode: u32) -> Result<Option<InodeHeader>>;

    /// Read the raw 512-byte metadata sector of one inode.
    fn read_inode_sector(&mut self, inode: u32, buf: &mut [u8]) -> Result<()>;

    /// Read inode data by data-relative sector offset.
    fn read_inode_data(&mut self, inode: u32, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Type of inode update log entries the volume uses.
    fn ilogtype(&self) -> u32 {
        0
    }

    /// Source software release, recorded as extra-info when present.
    fn source_release(&self) -> Option<String> {
        None
    }

    /// Whether the source filesystem uses 64-bit sector addressing.
    fn is_64bit(&self) -> bool {
        false
    }

    /// Whether the source drive is byte-swapped.
    fn byte_swapped(&self) -> bool {
        false
    }
}

/// Write access to a restore target.
///
/// A preflight probe checks capacities through `device_sectors` before
/// `allocate_partitions` makes the first destructive change.
pub trait RestoreTarget {
    fn device_sectors(&self, devno: u8) -> Option<u64>;

    /// Create the partition layout the image describes.
    fn allocate_partitions(&mut self, parts: &[PartitionDesc]) -> Result<()>;

    fn write_boot_block(&mut self, block: &[u8]) -> Result<()>;

    fn write_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;

    /// Bring up the MFS volume set over the allocated pairs (V1 path).
    fn init_mfs(&mut self, mfsparts: &[PartitionDesc]) -> Result<()>;

    /// Write by MFS volume address.
    fn write_mfs(&mut self, sector: u64, data: &[u8]) -> Result<()>;

    /// Recreate zone maps and reinitialize the filesystem (V3 path).
    fn reinit_mfs(&mut self, zones: &[ZoneMapDesc], ilogtype: u32) -> Result<()>;

    /// Store one restored inode: its decoded header, the verbatim metadata
    /// sector, and later its data through `write_inode_data`.
    fn write_inode(&mut self, header: &InodeHeader, sector: &[u8]) -> Result<()>;

    fn write_inode_data(&mut self, fsid: u32, offset: u64, data: &[u8]) -> Result<()>;
}

/// The MFS volume header as stored in sector 0 of the volume set.
///
/// Only the fields the engine needs to place V3 regions are modeled; the
/// backup stream always carries the sector verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MfsVolumeHeader {
    pub state: u32,
    pub root_fsid: u32,
    pub total_sectors: u32,
    pub logstart: u32,
    pub lognsectors: u32,
    pub logstamp: u32,
    pub unkstart: u32,
    pub unknsectors: u32,
    pub zonemap_sector: u32,
    pub partitionlist: String,
}

impl MfsVolumeHeader {
    const OFF_STATE: usize = 0;
    const OFF_MAGIC: usize = 4;
    const OFF_CHECKSUM: usize = 8;
    const OFF_ROOT_FSID: usize = 16;
    const OFF_PARTLIST: usize = 24;
    const PARTLIST_LEN: usize = 128;
    const OFF_TOTAL: usize = 152;
    const OFF_LOGSTART: usize = 156;
    const OFF_LOGSECTORS: usize = 160;
    const OFF_LOGSTAMP: usize = 164;
    const OFF_UNKSTART: usize = 168;
    const OFF_UNKSECTORS: usize = 172;
    const OFF_ZONEMAP: usize = 176;

    pub fn encode_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        BigEndian::write_u32(&mut buf[Self::OFF_STATE..], self.state);
        BigEndian::write_u32(&mut buf[Self::OFF_MAGIC..], MFS_MAGIC);
        BigEndian::write_u32(&mut buf[Self::OFF_ROOT_FSID..], self.root_fsid);
        let list = self.partitionlist.as_bytes();
        let n = list.len().min(Self::PARTLIST_LEN - 1);
        buf[Self::OFF_PARTLIST..Self::OFF_PARTLIST + n].copy_from_slice(&list[..n]);
        BigEndian::write_u32(&mut buf[Self::OFF_TOTAL..], self.total_sectors);
        BigEndian::write_u32(&mut buf[Self::OFF_LOGSTART..], self.logstart);
        BigEndian::write_u32(&mut buf[Self::OFF_LOGSECTORS..], self.lognsectors);
        BigEndian::write_u32(&mut buf[Self::OFF_LOGSTAMP..], self.logstamp);
        BigEndian::write_u32(&mut buf[Self::OFF_UNKSTART..], self.unkstart);
        BigEndian::write_u32(&mut buf[Self::OFF_UNKSECTORS..], self.unknsectors);
        BigEndian::write_u32(&mut buf[Self::OFF_ZONEMAP..], self.zonemap_sector);
        let crc = crate::format::sector_checksum(&{
            let mut scratch = buf;
            scratch[Self::OFF_CHECKSUM..Self::OFF_CHECKSUM + 4].fill(0);
            scratch
        });
        BigEndian::write_u32(&mut buf[Self::OFF_CHECKSUM..], crc);
        buf
    }

    pub fn decode_sector(buf: &[u8]) -> Result<Self> {
        let magic = BigEndian::read_u32(&buf[Self::OFF_MAGIC..]);
        if magic != MFS_MAGIC {
            return Err(StreamError::BadMagic { magic }.into());
        }
        let stored = BigEndian::read_u32(&buf[Self::OFF_CHECKSUM..]);
        let mut scratch = [0u8; SECTOR_SIZE];
        scratch.copy_from_slice(&buf[..SECTOR_SIZE]);
        scratch[Self::OFF_CHECKSUM..Self::OFF_CHECKSUM + 4].fill(0);
        if stored != crate::format::sector_checksum(&scratch) {
            return Err(StreamError::BadChecksum { got: stored }.into());
        }
        let list_end = buf[Self::OFF_PARTLIST..Self::OFF_PARTLIST + Self::PARTLIST_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::PARTLIST_LEN);
        Ok(Self {
            state: BigEndian::read_u32(&buf[Self::OFF_STATE..]),
            root_fsid: BigEndian::read_u32(&buf[Self::OFF_ROOT_FSID..]),
            total_sectors: BigEndian::read_u32(&buf[Self::OFF_TOTAL..]),
            logstart: BigEndian::read_u32(&buf[Self::OFF_LOGSTART..]),
            lognsectors: BigEndian::read_u32(&buf[Self::OFF_LOGSECTORS..]),
            logstamp: BigEndian::read_u32(&buf[Self::OFF_LOGSTAMP..]),
            unkstart: BigEndian::read_u32(&buf[Self::OFF_UNKSTART..]),
            unknsectors: BigEndian::read_u32(&buf[Self::OFF_UNKSECTORS..]),
            zonemap_sector: BigEndian::read_u32(&buf[Self::OFF_ZONEMAP..]),
            partitionlist: String::from_utf8_lossy(
                &buf[Self::OFF_PARTLIST..Self::OFF_PARTLIST + list_end],
            )
            .into_owned(),
        })
    }

    pub fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            total_sectors: self.total_sectors as u64,
            logstart: self.logstart as u64,
            lognsectors: self.lognsectors,
            unkstart: self.unkstart as u64,
            unknsectors: self.unknsectors,
            zonemap_start: self.zonemap_sector as u64,
        }
    }
}

/// On-disk zone map header, at the head of each map in the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneMapHeader {
    pub sector: u32,
    pub sbackup: u32,
    /// Map length in sectors.
    pub length: u32,
    /// Next map in the chain; 0 terminates.
    pub next_sector: u32,
    pub zone_type: u32,
    /// First and last sector the zone covers.
    pub first: u32,
    pub last: u32,
    /// Covered size in sectors.
    pub size: u64,
    /// Minimum allocation unit in sectors.
    pub min_au: u32,
    pub fsmem_base: u32,
}

impl ZoneMapHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.sector);
        BigEndian::write_u32(&mut buf[4..], self.sbackup);
        BigEndian::write_u32(&mut buf[8..], self.length);
        BigEndian::write_u32(&mut buf[12..], self.next_sector);
        BigEndian::write_u32(&mut buf[16..], self.zone_type);
        BigEndian::write_u32(&mut buf[20..], self.first);
        BigEndian::write_u32(&mut buf[24..], self.last);
        BigEndian::write_u64(&mut buf[28..], self.size);
        BigEndian::write_u32(&mut buf[36..], self.min_au);
        BigEndian::write_u32(&mut buf[40..], self.fsmem_base);
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            sector: BigEndian::read_u32(&buf[0..]),
            sbackup: BigEndian::read_u32(&buf[4..]),
            length: BigEndian::read_u32(&buf[8..]),
            next_sector: BigEndian::read_u32(&buf[12..]),
            zone_type: BigEndian::read_u32(&buf[16..]),
            first: BigEndian::read_u32(&buf[20..]),
            last: BigEndian::read_u32(&buf[24..]),
            size: BigEndian::read_u64(&buf[28..]),
            min_au: BigEndian::read_u32(&buf[36..]),
            fsmem_base: BigEndian::read_u32(&buf[40..]),
        }
    }

    pub fn descriptor(&self) -> ZoneMapDesc {
        ZoneMapDesc {
            map_length: self.length,
            zone_type: self.zone_type,
            fsmem_base: self.fsmem_base,
            min_au: self.min_au,
            size: self.size,
        }
    }
}

const APM_SIGNATURE: u16 = 0x504d; // "PM"
const APM_TYPE_OFF: usize = 48;
const APM_NAME_OFF: usize = 16;

fn apm_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct RawPartition {
    devno: u8,
    partno: u8,
    start: u64,
    sectors: u32,
    ptype: String,
    name: String,
}

/// Source volume set opened from raw devices.
pub struct RawVolume {
    devs: Vec<FileDevice>,
    parts: Vec<RawPartition>,
    mfs_order: Vec<usize>,
    geometry: VolumeGeometry,
    zones: Vec<ZoneMapHeader>,
    inode_zone: Option<ZoneMapHeader>,
}

impl RawVolume {
    /// Open a primary device and an optional secondary, enumerate their
    /// partition maps, and locate the MFS volume set.
    pub fn open(primary: &str, secondary: Option<&str>) -> Result<Self> {
        let mut devs = vec![FileDevice::open(primary)?];
        if let Some(path) = secondary {
            devs.push(FileDevice::open(path)?);
        }

        let mut parts = Vec::new();
        for (devno, dev) in devs.iter_mut().enumerate() {
            scan_partition_map(devno as u8, dev, &mut parts)?;
        }
        let mfs_order: Vec<usize> = parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ptype == "MFS")
            .map(|(i, _)| i)
            .collect();
        if mfs_order.is_empty() {
            return Err(Error::Init {
                reason: format!("{primary}: no MFS partitions present"),
            });
        }

        let mut volume = Self {
            devs,
            parts,
            mfs_order,
            geometry: VolumeGeometry::default(),
            zones: Vec::new(),
            inode_zone: None,
        };

        let mut sector0 = [0u8; SECTOR_SIZE];
        volume.read_mfs(0, &mut sector0)?;
        let header = MfsVolumeHeader::decode_sector(&sector0).map_err(|_| Error::Init {
            reason: format!("{primary}: no MFS volume signature"),
        })?;
        volume.geometry = header.geometry();
        volume.scan_zone_maps()?;
        debug!(
            zones = volume.zones.len(),
            total_sectors = volume.geometry.total_sectors,
            "opened MFS volume set"
        );
        Ok(volume)
    }

    fn scan_zone_maps(&mut self) -> Result<()> {
        let mut next = self.geometry.zonemap_start;
        let mut buf = [0u8; SECTOR_SIZE];
        while next != 0 {
            self.read_mfs(next, &mut buf)?;
            let zone = ZoneMapHeader::decode(&buf);
            if zone.sector as u64 != next && zone.sbackup as u64 != next {
                return Err(Error::Scan {
                    reason: format!("zone map chain broken at sector {next}"),
                });
            }
            if zone.zone_type == ZONE_INODE {
                self.inode_zone = Some(zone);
            }
            next = zone.next_sector as u64;
            self.zones.push(zone);
            if self.zones.len() > 64 {
                return Err(Error::Scan {
                    reason: "zone map chain does not terminate".into(),
                });
            }
        }
        Ok(())
    }

    /// MFS address of an inode's metadata sector. Inodes occupy two sectors
    /// each (primary plus backup copy) from the start of the inode zone.
    fn inode_sector(&self, inode: u32) -> Result<u64> {
        let zone = self.inode_zone.ok_or(StreamError::Other {
            context: "volume has no inode zone",
        })?;
        Ok(zone.first as u64 + inode as u64 * 2)
    }
}

fn scan_partition_map(
    devno: u8,
    dev: &mut FileDevice,
    parts: &mut Vec<RawPartition>,
) -> Result<()> {
    let mut buf = [0u8; SECTOR_SIZE];
    let mut entries = 1u32;
    let mut index = 1u64;
    while index <= entries as u64 {
        dev.read_sectors(index, &mut buf)?;
        if BigEndian::read_u16(&buf) != APM_SIGNATURE {
            return Err(Error::Init {
                reason: format!("device {devno}: partition map entry {index} is not valid"),
            });
        }
        entries = BigEndian::read_u32(&buf[4..]);
        let ptype = apm_string(&buf[APM_TYPE_OFF..APM_TYPE_OFF + 32]);
        if ptype != "Apple_partition_map" && ptype != "Apple_Free" {
            parts.push(RawPartition {
                devno,
                partno: index as u8,
                start: BigEndian::read_u32(&buf[8..]) as u64,
                sectors: BigEndian::read_u32(&buf[12..]),
                ptype,
                name: apm_string(&buf[APM_NAME_OFF..APM_NAME_OFF + 32]),
            });
        }
        index += 1;
    }
    Ok(())
}

impl RawVolume {
    fn find_part(&self, devno: u8, partno: u8) -> Result<&RawPartition> {
        self.parts
            .iter()
            .find(|p| p.devno == devno && p.partno == partno)
            .ok_or_else(|| StreamError::MissingDevice { devno, partno }.into())
    }
}

impl VolumeAccess for RawVolume {
    fn device_sectors(&self, devno: u8) -> Option<u64> {
        self.devs.get(devno as usize).map(|d| d.sectors())
    }

    fn partitions(&self) -> Vec<SourcePartition> {
        self.parts
            .iter()
            .filter(|p| p.ptype != "MFS")
            .map(|p| SourcePartition {
                desc: PartitionDesc {
                    sectors: p.sectors,
                    partno: p.partno,
                    devno: p.devno,
                },
                is_var: p.name == "/var",
            })
            .collect()
    }

    fn mfs_partitions(&self) -> Vec<PartitionDesc> {
        self.mfs_order
            .iter()
            .map(|&i| {
                let p = &self.parts[i];
                PartitionDesc {
                    sectors: p.sectors,
                    partno: p.partno,
                    devno: p.devno,
                }
            })
            .collect()
    }

    fn read_boot_block(&mut self, buf: &mut [u8]) -> Result<()> {
        self.devs[0].read_sectors(0, buf)
    }

    fn read_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let start = self.find_part(devno, partno)?.start;
        self.devs[devno as usize].read_sectors(start + offset, buf)
    }

    fn read_mfs(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        // MFS addresses run across the volume pairs in list order.
        let mut base = 0u64;
        for &i in &self.mfs_order {
            let (devno, start, sectors) = {
                let p = &self.parts[i];
                (p.devno, p.start, p.sectors as u64)
            };
            if sector < base + sectors {
                return self.devs[devno as usize]
                    .read_sectors(start + (sector - base), buf);
            }
            base += sectors;
        }
        Err(StreamError::ShortRead {
            sector,
            count: (buf.len() / SECTOR_SIZE) as u32,
        }
        .into())
    }

    fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    fn mfs_blocks(&self) -> Vec<BlockDesc> {
        // V1 images carry all of MFS as one range per volume pair.
        let mut blocks = Vec::new();
        let mut base = 0u64;
        for &i in &self.mfs_order {
            let sectors = self.parts[i].sectors;
            blocks.push(BlockDesc {
                firstsector: base as u32,
                sectors,
            });
            base += sectors as u64;
        }
        blocks
    }

    fn zone_maps(&self) -> Vec<ZoneMapDesc> {
        self.zones.iter().map(|z| z.descriptor()).collect()
    }

    fn zone_extents(&self) -> Vec<ZoneExtent> {
        self.zones
            .iter()
            .map(|z| ZoneExtent {
                zone_type: z.zone_type,
                first: z.first as u64,
                size: z.size,
            })
            .collect()
    }

    fn inode_count(&self) -> u32 {
        self.inode_zone.map_or(0, |z| (z.size / 2) as u32)
    }

    fn read_inode(&mut self, inode: u32) -> Result<Option<InodeHeader>> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_inode_sector(inode, &mut buf)?;
        match InodeHeader::decode_sector(&buf, crate::format::Endian { swapped: false }) {
            Ok(header) if header.refcount > 0 => Ok(Some(header)),
            _ => Ok(None),
        }
    }

    fn read_inode_sector(&mut self, inode: u32, buf: &mut [u8]) -> Result<()> {
        let sector = self.inode_sector(inode)?;
        self.read_mfs(sector, buf)
    }

    fn read_inode_data(&mut self, inode: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let header = self
            .read_inode(inode)?
            .ok_or(StreamError::InodeRead { inode })?;
        // Map the data-relative offset through the extent list.
        let mut remaining_skip = offset;
        let mut out = 0usize;
        for extent in &header.extents {
            let count = extent.count as u64;
            if remaining_skip >= count {
                remaining_skip -= count;
                continue;
            }
            let avail = count - remaining_skip;
            let want = ((buf.len() - out) / SECTOR_SIZE) as u64;
            let take = avail.min(want);
            let end = out + take as usize * SECTOR_SIZE;
            self.read_mfs(
                extent.sector as u64 + remaining_skip,
                &mut buf[out..end],
            )?;
            out = end;
            remaining_skip = 0;
            if out == buf.len() {
                return Ok(());
            }
        }
        if out != buf.len() {
            return Err(StreamError::InodeRead { inode }.into());
        }
        Ok(())
    }
}

/// Restore target over raw devices.
///
/// Partitions are laid out sequentially after a reserved map area at the
/// front of each device, and a fresh partition map is written as the layout
/// grows. MFS addressing becomes available once `init_mfs` has named the
/// volume pairs.
pub struct RawTarget {
    devs: Vec<FileDevice>,
    parts: Vec<RawPartition>,
    mfs_order: Vec<usize>,
    /// Per-device allocation cursor, starting past the map area.
    next_free: Vec<u64>,
    geometry: VolumeGeometry,
    inode_zone_first: u64,
    inodes_written: u64,
    inode_headers: HashMap<u32, InodeHeader>,
}

/// Sectors reserved at the front of each device for the boot block and the
/// partition map.
const MAP_AREA_SECTORS: u64 = 64;

impl RawTarget {
    pub fn open(primary: &str, secondary: Option<&str>) -> Result<Self> {
        let mut devs = vec![FileDevice::open_rw(primary)?];
        if let Some(path) = secondary {
            devs.push(FileDevice::open_rw(path)?);
        }
        let next_free = vec![MAP_AREA_SECTORS; devs.len()];
        Ok(Self {
            devs,
            parts: Vec::new(),
            mfs_order: Vec::new(),
            next_free,
            geometry: VolumeGeometry::default(),
            inode_zone_first: 0,
            inodes_written: 0,
            inode_headers: HashMap::new(),
        })
    }

    fn write_partition_map(&mut self) -> Result<()> {
        for (devno, dev) in self.devs.iter_mut().enumerate() {
            let on_dev: Vec<&RawPartition> =
                self.parts.iter().filter(|p| p.devno as usize == devno).collect();
            if on_dev.is_empty() {
                continue;
            }
            let entries = on_dev.iter().map(|p| p.partno as u32).max().unwrap_or(1).max(1);
            for index in 1..=entries {
                let mut buf = [0u8; SECTOR_SIZE];
                BigEndian::write_u16(&mut buf, APM_SIGNATURE);
                BigEndian::write_u32(&mut buf[4..], entries);
                let (start, sectors, name, ptype): (u64, u32, &str, &str) =
                    if let Some(p) = on_dev.iter().find(|p| p.partno as u32 == index) {
                        (p.start, p.sectors, p.name.as_str(), p.ptype.as_str())
                    } else if index == 1 {
                        (1, MAP_AREA_SECTORS as u32 - 1, "Apple", "Apple_partition_map")
                    } else {
                        (0, 0, "", "Apple_Free")
                    };
                BigEndian::write_u32(&mut buf[8..], start as u32);
                BigEndian::write_u32(&mut buf[12..], sectors);
                let n = name.len().min(31);
                buf[APM_NAME_OFF..APM_NAME_OFF + n].copy_from_slice(&name.as_bytes()[..n]);
                let n = ptype.len().min(31);
                buf[APM_TYPE_OFF..APM_TYPE_OFF + n].copy_from_slice(&ptype.as_bytes()[..n]);
                dev.write_sectors(index as u64, &buf)?;
            }
        }
        Ok(())
    }

    fn find_part_mut(&mut self, devno: u8, partno: u8) -> Result<&mut RawPartition> {
        self.parts
            .iter_mut()
            .find(|p| p.devno == devno && p.partno == partno)
            .ok_or_else(|| StreamError::MissingDevice { devno, partno }.into())
    }
}

impl RestoreTarget for RawTarget {
    fn device_sectors(&self, devno: u8) -> Option<u64> {
        self.devs.get(devno as usize).map(|d| d.sectors())
    }

    fn allocate_partitions(&mut self, parts: &[PartitionDesc]) -> Result<()> {
        for part in parts {
            let devno = part.devno as usize;
            let dev = self.devs.get(devno).ok_or(StreamError::MissingDevice {
                devno: part.devno,
                partno: part.partno,
            })?;
            let start = self.next_free[devno];
            let end = start + part.sectors as u64;
            if end > dev.sectors() {
                return Err(StreamError::TargetTooSmall {
                    devno: part.devno,
                    need: end,
                    have: dev.sectors(),
                }
                .into());
            }
            self.parts.push(RawPartition {
                devno: part.devno,
                partno: part.partno,
                start,
                sectors: part.sectors,
                ptype: "Apple_UNIX_SVR2".into(),
                name: String::new(),
            });
            self.next_free[devno] = end;
        }
        debug!(parts = self.parts.len(), "target partitions allocated");
        self.write_partition_map()
    }

    fn write_boot_block(&mut self, block: &[u8]) -> Result<()> {
        self.devs[0].write_sectors(0, block)
    }

    fn write_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let start = self.find_part_mut(devno, partno)?.start;
        self.devs[devno as usize].write_sectors(start + offset, data)
    }

    fn init_mfs(&mut self, mfsparts: &[PartitionDesc]) -> Result<()> {
        for part in mfsparts {
            let index = self
                .parts
                .iter()
                .position(|p| p.devno == part.devno && p.partno == part.partno)
                .ok_or(StreamError::MissingDevice {
                    devno: part.devno,
                    partno: part.partno,
                })?;
            self.parts[index].ptype = "MFS".into();
            self.mfs_order.push(index);
        }
        self.write_partition_map()
    }

    fn write_mfs(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        // The restored volume header carries the geometry the later
        // regions are placed by.
        if sector == 0 && data.len() >= SECTOR_SIZE {
            self.geometry = MfsVolumeHeader::decode_sector(data)?.geometry();
        }
        let mut base = 0u64;
        for &i in &self.mfs_order {
            let (devno, start, sectors) = {
                let p = &self.parts[i];
                (p.devno, p.start, p.sectors as u64)
            };
            if sector < base + sectors {
                return self.devs[devno as usize]
                    .write_sectors(start + (sector - base), data);
            }
            base += sectors;
        }
        Err(StreamError::ShortWrite {
            sector,
            count: (data.len() / SECTOR_SIZE) as u32,
        }
        .into())
    }

    fn reinit_mfs(&mut self, zones: &[ZoneMapDesc], ilogtype: u32) -> Result<()> {
        // Rebuild the zone map chain where the volume header points,
        // laying each zone's extent out right after the maps.
        let total_maps: u64 = zones.iter().map(|z| z.map_length as u64).sum();
        let mut map_sector = self.geometry.zonemap_start;
        let mut data_cursor = map_sector + total_maps;
        debug!(zones = zones.len(), ilogtype, "rebuilding zone maps");
        for (i, desc) in zones.iter().enumerate() {
            let next = if i + 1 == zones.len() {
                0
            } else {
                map_sector + desc.map_length as u64
            };
            if desc.zone_type == crate::format::ZONE_INODE {
                self.inode_zone_first = data_cursor;
            }
            let header = ZoneMapHeader {
                sector: map_sector as u32,
                sbackup: map_sector as u32,
                length: desc.map_length,
                next_sector: next as u32,
                zone_type: desc.zone_type,
                first: data_cursor as u32,
                last: (data_cursor + desc.size).saturating_sub(1) as u32,
                size: desc.size,
                min_au: desc.min_au,
                fsmem_base: desc.fsmem_base,
            };
            let mut buf = [0u8; SECTOR_SIZE];
            header.encode(&mut buf);
            self.write_mfs(map_sector, &buf)?;
            data_cursor += desc.size;
            map_sector += desc.map_length as u64;
        }
        Ok(())
    }

    fn write_inode(&mut self, header: &InodeHeader, sector: &[u8]) -> Result<()> {
        let at = self.inode_zone_first + self.inodes_written * 2;
        self.write_mfs(at, sector)?;
        self.write_mfs(at + 1, sector)?;
        self.inode_headers.insert(header.fsid, header.clone());
        self.inodes_written += 1;
        Ok(())
    }

    fn write_inode_data(&mut self, fsid: u32, offset: u64, data: &[u8]) -> Result<()> {
        let header = self
            .inode_headers
            .get(&fsid)
            .cloned()
            .ok_or(StreamError::InodeWrite { inode: fsid })?;
        // Data goes back to the extents the source inode named.
        let mut remaining_skip = offset;
        let mut written = 0usize;
        for extent in &header.extents {
            let count = extent.count as u64;
            if remaining_skip >= count {
                remaining_skip -= count;
                continue;
            }
            let room = count - remaining_skip;
            let want = ((data.len() - written) / SECTOR_SIZE) as u64;
            let take = room.min(want);
            let end = written + take as usize * SECTOR_SIZE;
            self.write_mfs(
                extent.sector as u64 + remaining_skip,
                &data[written..end],
            )?;
            written = end;
            remaining_skip = 0;
            if written == data.len() {
                return Ok(());
            }
        }
        if written != data.len() {
            return Err(StreamError::InodeWrite { inode: fsid }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_header_round_trip() {
        let header = MfsVolumeHeader {
            state: 0,
            root_fsid: 1,
            total_sectors: 1_000_000,
            logstart: 2048,
            lognsectors: 128,
            logstamp: 42,
            unkstart: 2176,
            unknsectors: 64,
            zonemap_sector: 2240,
            partitionlist: "/dev/hda10 /dev/hda11".into(),
        };
        let sector = header.encode_sector();
        let back = MfsVolumeHeader::decode_sector(&sector).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn volume_header_rejects_corruption() {
        let header = MfsVolumeHeader::default();
        let mut sector = header.encode_sector();
        assert!(MfsVolumeHeader::decode_sector(&sector).is_err(), "zero magic");
        sector = MfsVolumeHeader {
            total_sectors: 5,
            ..Default::default()
        }
        .encode_sector();
        sector[200] ^= 1;
        assert!(MfsVolumeHeader::decode_sector(&sector).is_err());
    }

    #[test]
    fn zone_map_header_round_trip() {
        let zone = ZoneMapHeader {
            sector: 2240,
            sbackup: 999_000,
            length: 10,
            next_sector: 0,
            zone_type: crate::format::ZONE_MEDIA,
            first: 10_000,
            last: 500_000,
            size: 490_001,
            min_au: 2048,
            fsmem_base: 0x3000_0000,
        };
        let mut buf = [0u8; SECTOR_SIZE];
        zone.encode(&mut buf);
        assert_eq!(ZoneMapHeader::decode(&buf), zone);
        assert_eq!(zone.descriptor().size, 490_001);
    }
}
