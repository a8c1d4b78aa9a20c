//! In-memory volume implementations.
//!
//! [`SyntheticVolume`] builds a complete, internally consistent MFS volume
//! set in memory and implements [`VolumeAccess`] over it;
//! [`SyntheticTarget`] implements [`RestoreTarget`] by recording everything
//! a restore writes. Together they let round-trip tests compare a restored
//! volume against its source byte for byte without touching real devices.

use std::collections::HashMap;

use crate::device::{BlockDevice, MemDevice, SECTOR_SIZE};
use crate::format::{
    BlockDesc, DataExtent, InodeHeader, PartitionDesc, ZoneMapDesc, INODE_DATA, TY_STREAM,
    ZONE_APPLICATION, ZONE_INODE, ZONE_MEDIA,
};
use crate::volume::{
    MfsVolumeHeader, RestoreTarget, SourcePartition, VolumeAccess, VolumeGeometry, ZoneExtent,
    ZoneMapHeader,
};
use crate::{Result, StreamError};

/// One inode to place in a synthetic volume.
pub struct InodeSpec {
    pub fsid: u32,
    pub fstype: u8,
    pub data: Vec<u8>,
    /// Keep the data inside the metadata sector instead of allocating
    /// extents. Only sensible for small payloads.
    pub inline: bool,
}

impl InodeSpec {
    pub fn file(fsid: u32, data: Vec<u8>) -> Self {
        Self { fsid, fstype: crate::format::TY_FILE, data, inline: false }
    }

    pub fn stream(fsid: u32, data: Vec<u8>) -> Self {
        Self { fsid, fstype: TY_STREAM, data, inline: false }
    }
}

/// Builder for [`SyntheticVolume`].
pub struct SyntheticVolumeBuilder {
    boot_block: [u8; SECTOR_SIZE],
    device_sectors: Vec<u64>,
    partitions: Vec<(SourcePartition, Vec<u8>)>,
    inodes: Vec<InodeSpec>,
    log_sectors: u32,
    unk_sectors: u32,
    media_slack: u64,
    release: Option<String>,
}

impl Default for SyntheticVolumeBuilder {
    fn default() -> Self {
        Self {
            boot_block: [0; SECTOR_SIZE],
            device_sectors: vec![0],
            partitions: Vec::new(),
            inodes: Vec::new(),
            log_sectors: 8,
            unk_sectors: 4,
            media_slack: 0,
            release: None,
        }
    }
}

impl SyntheticVolumeBuilder {
    pub fn boot_block(mut self, fill: u8) -> Self {
        self.boot_block = [fill; SECTOR_SIZE];
        self
    }

    /// Add a non-MFS partition with a deterministic body pattern.
    pub fn partition(mut self, devno: u8, partno: u8, sectors: u32, is_var: bool) -> Self {
        let mut body = vec![0u8; sectors as usize * SECTOR_SIZE];
        for (i, byte) in body.iter_mut().enumerate() {
            *byte = (i as u32)
                .wrapping_mul(31)
                .wrapping_add((devno as u32) << 4 | partno as u32) as u8;
        }
        self.partitions.push((
            SourcePartition {
                desc: PartitionDesc { sectors, partno, devno },
                is_var,
            },
            body,
        ));
        while self.device_sectors.len() <= devno as usize {
            self.device_sectors.push(0);
        }
        self
    }

    pub fn inode(mut self, spec: InodeSpec) -> Self {
        self.inodes.push(spec);
        self
    }

    pub fn log_sectors(mut self, sectors: u32) -> Self {
        self.log_sectors = sectors;
        self
    }

    /// Extra unused media-zone sectors, to exercise shrink accounting.
    pub fn media_slack(mut self, sectors: u64) -> Self {
        self.media_slack = sectors;
        self
    }

    pub fn release(mut self, release: &str) -> Self {
        self.release = Some(release.to_string());
        self
    }

    pub fn build(self) -> SyntheticVolume {
        // Lay the MFS area out front to back: volume header, transaction
        // log, unnamed region, zone map chain, inode table, data.
        let log_start = 1u64;
        let unk_start = log_start + self.log_sectors as u64;
        let zone_start = unk_start + self.unk_sectors as u64;
        let nzones = 3u64;
        let inode_start = zone_start + nzones;
        let inode_slots = self.inodes.len() as u64;
        let data_start = inode_start + inode_slots * 2;

        let app_data: u64 = self
            .inodes
            .iter()
            .filter(|s| s.fstype != TY_STREAM && !s.inline)
            .map(|s| s.data.len().div_ceil(SECTOR_SIZE) as u64)
            .sum();
        let media_data: u64 = self
            .inodes
            .iter()
            .filter(|s| s.fstype == TY_STREAM && !s.inline)
            .map(|s| s.data.len().div_ceil(SECTOR_SIZE) as u64)
            .sum();
        let media_start = data_start + app_data;
        let total = media_start + media_data + self.media_slack;

        let mut mfs = MemDevice::new(total);

        // Pseudo content for the regions the image carries verbatim.
        let mut log = vec![0u8; self.log_sectors as usize * SECTOR_SIZE];
        for (i, b) in log.iter_mut().enumerate() {
            *b = (i as u32).wrapping_mul(7) as u8;
        }
        mfs.write_sectors(log_start, &log).unwrap();
        let mut unk = vec![0u8; self.unk_sectors as usize * SECTOR_SIZE];
        for (i, b) in unk.iter_mut().enumerate() {
            *b = (i as u32).wrapping_mul(13).wrapping_add(3) as u8;
        }
        mfs.write_sectors(unk_start, &unk).unwrap();

        let zones = [
            ZoneMapHeader {
                sector: zone_start as u32,
                sbackup: zone_start as u32,
                length: 1,
                next_sector: (zone_start + 1) as u32,
                zone_type: ZONE_INODE,
                first: inode_start as u32,
                last: (data_start - 1) as u32,
                size: inode_slots * 2,
                min_au: 1,
                fsmem_base: 0x3000_0000,
            },
            ZoneMapHeader {
                sector: (zone_start + 1) as u32,
                sbackup: (zone_start + 1) as u32,
                length: 1,
                next_sector: (zone_start + 2) as u32,
                zone_type: ZONE_APPLICATION,
                first: data_start as u32,
                last: (media_start - 1).max(data_start) as u32,
                size: app_data,
                min_au: 1,
                fsmem_base: 0x3100_0000,
            },
            ZoneMapHeader {
                sector: (zone_start + 2) as u32,
                sbackup: (zone_start + 2) as u32,
                length: 1,
                next_sector: 0,
                zone_type: ZONE_MEDIA,
                first: media_start as u32,
                last: (total - 1) as u32,
                size: media_data + self.media_slack,
                min_au: 2048,
                fsmem_base: 0x3200_0000,
            },
        ];
        for zone in &zones {
            let mut buf = [0u8; SECTOR_SIZE];
            zone.encode(&mut buf);
            mfs.write_sectors(zone.sector as u64, &buf).unwrap();
        }

        // Place inode data and write the metadata sectors.
        let mut headers = Vec::new();
        let mut app_cursor = data_start;
        let mut media_cursor = media_start;
        for (slot, spec) in self.inodes.iter().enumerate() {
            let data_sectors = spec.data.len().div_ceil(SECTOR_SIZE) as u64;
            let mut header = InodeHeader {
                fsid: spec.fsid,
                refcount: 1,
                inode: slot as u32,
                size: spec.data.len() as u32,
                blocksize: SECTOR_SIZE as u32,
                blockused: data_sectors as u32,
                lastmodified: 1_000_000_000 + slot as u32,
                fstype: spec.fstype,
                ..Default::default()
            };
            if spec.inline {
                header.inode_flags |= INODE_DATA;
            } else if data_sectors > 0 {
                let cursor = if spec.fstype == TY_STREAM {
                    &mut media_cursor
                } else {
                    &mut app_cursor
                };
                header.extents.push(DataExtent {
                    sector: *cursor as u32,
                    count: data_sectors as u32,
                });
                let mut padded = spec.data.clone();
                padded.resize(data_sectors as usize * SECTOR_SIZE, 0);
                mfs.write_sectors(*cursor, &padded).unwrap();
                *cursor += data_sectors;
            }
            let sector_image = header.encode_sector();
            mfs.write_sectors(inode_start + slot as u64 * 2, &sector_image)
                .unwrap();
            mfs.write_sectors(inode_start + slot as u64 * 2 + 1, &sector_image)
                .unwrap();
            headers.push(header);
        }

        let header = MfsVolumeHeader {
            state: 0,
            root_fsid: 1,
            total_sectors: total as u32,
            logstart: log_start as u32,
            lognsectors: self.log_sectors,
            logstamp: 1,
            unkstart: unk_start as u32,
            unknsectors: self.unk_sectors,
            zonemap_sector: zone_start as u32,
            partitionlist: "/dev/hda10 /dev/hda11".into(),
        };
        mfs.write_sectors(0, &header.encode_sector()).unwrap();

        // Model the volume set as one application pair plus one media pair.
        let app_pair = data_start + app_data;
        let mfsparts = vec![
            PartitionDesc { sectors: app_pair as u32, partno: 10, devno: 0 },
            PartitionDesc { sectors: (total - app_pair) as u32, partno: 11, devno: 0 },
        ];

        let mut device_sectors = self.device_sectors;
        for (part, _) in &self.partitions {
            device_sectors[part.desc.devno as usize] += part.desc.sectors as u64;
        }
        device_sectors[0] += total + 64;

        SyntheticVolume {
            boot_block: self.boot_block,
            device_sectors,
            partitions: self.partitions,
            mfsparts,
            mfs,
            geometry: header.geometry(),
            zones: zones.to_vec(),
            inodes: headers,
            release: self.release,
        }
    }
}

/// A complete in-memory MFS volume set.
pub struct SyntheticVolume {
    boot_block: [u8; SECTOR_SIZE],
    device_sectors: Vec<u64>,
    partitions: Vec<(SourcePartition, Vec<u8>)>,
    mfsparts: Vec<PartitionDesc>,
    mfs: MemDevice,
    geometry: VolumeGeometry,
    zones: Vec<ZoneMapHeader>,
    inodes: Vec<InodeHeader>,
    release: Option<String>,
}

impl SyntheticVolume {
    pub fn builder() -> SyntheticVolumeBuilder {
        SyntheticVolumeBuilder::default()
    }

    /// Raw bytes of the MFS area, for byte-level comparison in tests.
    pub fn mfs_bytes(&self) -> &[u8] {
        self.mfs.as_bytes()
    }

    pub fn partition_body(&self, devno: u8, partno: u8) -> Option<&[u8]> {
        self.partitions
            .iter()
            .find(|(p, _)| p.desc.devno == devno && p.desc.partno == partno)
            .map(|(_, body)| body.as_slice())
    }

    pub fn boot_block_bytes(&self) -> &[u8] {
        &self.boot_block
    }
}

impl VolumeAccess for SyntheticVolume {
    fn device_sectors(&self, devno: u8) -> Option<u64> {
        self.device_sectors.get(devno as usize).copied()
    }

    fn partitions(&self) -> Vec<SourcePartition> {
        self.partitions.iter().map(|(p, _)| *p).collect()
    }

    fn mfs_partitions(&self) -> Vec<PartitionDesc> {
        self.mfsparts.clone()
    }

    fn read_boot_block(&mut self, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(&self.boot_block);
        Ok(())
    }

    fn read_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let body = self
            .partition_body(devno, partno)
            .ok_or(StreamError::MissingDevice { devno, partno })?;
        let start = offset as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > body.len() {
            return Err(StreamError::ShortRead {
                sector: offset,
                count: (buf.len() / SECTOR_SIZE) as u32,
            }
            .into());
        }
        buf.copy_from_slice(&body[start..end]);
        Ok(())
    }

    fn read_mfs(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.mfs.read_sectors(sector, buf)
    }

    fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    fn mfs_blocks(&self) -> Vec<BlockDesc> {
        let total = self.geometry.total_sectors;
        // Split at the media pair boundary, as a real scan would.
        let split = self.mfsparts[0].sectors as u64;
        vec![
            BlockDesc { firstsector: 0, sectors: split as u32 },
            BlockDesc { firstsector: split as u32, sectors: (total - split) as u32 },
        ]
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
        self.inodes.len() as u32
    }

    fn read_inode(&mut self, inode: u32) -> Result<Option<InodeHeader>> {
        Ok(self.inodes.get(inode as usize).cloned())
    }

    fn read_inode_sector(&mut self, inode: u32, buf: &mut [u8]) -> Result<()> {
        let zone = self.zones[0];
        self.mfs
            .read_sectors(zone.first as u64 + inode as u64 * 2, buf)
    }

    fn read_inode_data(&mut self, inode: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let header = self
            .inodes
            .get(inode as usize)
            .ok_or(StreamError::InodeRead { inode })?
            .clone();
        let extent = header.extents.first().ok_or(StreamError::InodeRead { inode })?;
        self.mfs.read_sectors(extent.sector as u64 + offset, buf)
    }

    fn source_release(&self) -> Option<String> {
        self.release.clone()
    }
}

/// A restore target that records everything written to it.
#[derive(Default)]
pub struct SyntheticTarget {
    pub device_sectors: Vec<u64>,
    pub allocated: Vec<PartitionDesc>,
    pub boot_block: Vec<u8>,
    pub partitions: HashMap<(u8, u8), Vec<u8>>,
    pub mfs: Vec<u8>,
    pub mfs_inited: bool,
    pub reinit: Option<(Vec<ZoneMapDesc>, u32)>,
    pub inodes: Vec<(InodeHeader, Vec<u8>)>,
    pub inode_data: HashMap<u32, Vec<u8>>,
}

impl SyntheticTarget {
    pub fn new(device_sectors: Vec<u64>) -> Self {
        Self { device_sectors, ..Default::default() }
    }
}

impl RestoreTarget for SyntheticTarget {
    fn device_sectors(&self, devno: u8) -> Option<u64> {
        self.device_sectors.get(devno as usize).copied()
    }

    fn allocate_partitions(&mut self, parts: &[PartitionDesc]) -> Result<()> {
        self.allocated = parts.to_vec();
        for part in parts {
            self.partitions.insert(
                (part.devno, part.partno),
                vec![0; part.sectors as usize * SECTOR_SIZE],
            );
        }
        Ok(())
    }

    fn write_boot_block(&mut self, block: &[u8]) -> Result<()> {
        self.boot_block = block.to_vec();
        Ok(())
    }

    fn write_partition(
        &mut self,
        devno: u8,
        partno: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let body = self
            .partitions
            .get_mut(&(devno, partno))
            .ok_or(StreamError::MissingDevice { devno, partno })?;
        let start = offset as usize * SECTOR_SIZE;
        if start + data.len() > body.len() {
            return Err(StreamError::ShortWrite {
                sector: offset,
                count: (data.len() / SECTOR_SIZE) as u32,
            }
            .into());
        }
        body[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn init_mfs(&mut self, _mfsparts: &[PartitionDesc]) -> Result<()> {
        self.mfs_inited = true;
        Ok(())
    }

    fn write_mfs(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        let start = sector as usize * SECTOR_SIZE;
        if self.mfs.len() < start + data.len() {
            self.mfs.resize(start + data.len(), 0);
        }
        self.mfs[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn reinit_mfs(&mut self, zones: &[ZoneMapDesc], ilogtype: u32) -> Result<()> {
        self.reinit = Some((zones.to_vec(), ilogtype));
        Ok(())
    }

    fn write_inode(&mut self, header: &InodeHeader, sector: &[u8]) -> Result<()> {
        self.inodes.push((header.clone(), sector.to_vec()));
        Ok(())
    }

    fn write_inode_data(&mut self, fsid: u32, offset: u64, data: &[u8]) -> Result<()> {
        let body = self.inode_data.entry(fsid).or_default();
        let start = offset as usize * SECTOR_SIZE;
        if body.len() < start + data.len() {
            body.resize(start + data.len(), 0);
        }
        body[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_consistent_volume() {
        let mut vol = SyntheticVolume::builder()
            .boot_block(0xbb)
            .partition(0, 2, 4, false)
            .partition(0, 9, 2, true)
            .inode(InodeSpec::file(100, vec![1; 1500]))
            .inode(InodeSpec::stream(200, vec![2; 4096]))
            .build();

        assert_eq!(vol.partitions().len(), 2);
        assert_eq!(vol.mfs_partitions().len(), 2);
        assert_eq!(vol.inode_count(), 2);

        // The volume header in the MFS area decodes back to the geometry.
        let mut sector = [0u8; SECTOR_SIZE];
        vol.read_mfs(0, &mut sector).unwrap();
        let header = MfsVolumeHeader::decode_sector(&sector).unwrap();
        assert_eq!(header.geometry(), vol.geometry());

        // Inode metadata sectors decode to the enumerated inodes.
        let mut meta = [0u8; SECTOR_SIZE];
        vol.read_inode_sector(1, &mut meta).unwrap();
        let header =
            InodeHeader::decode_sector(&meta, crate::format::Endian { swapped: false }).unwrap();
        assert_eq!(header.fsid, 200);
        assert!(header.is_media());
        assert_eq!(header.backed_sectors(0), 8);
    }

    #[test]
    fn inode_data_reads_back() {
        let mut vol = SyntheticVolume::builder()
            .inode(InodeSpec::file(7, (0..3000u32).map(|i| i as u8).collect()))
            .build();
        let header = vol.read_inode(0).unwrap().unwrap();
        assert_eq!(header.backed_sectors(0), 6);
        let mut buf = vec![0u8; 6 * SECTOR_SIZE];
        vol.read_inode_data(0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..3000], &(0..3000u32).map(|i| i as u8).collect::<Vec<_>>()[..]);
        assert!(buf[3000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn zone_extents_cover_the_data_area() {
        let vol = SyntheticVolume::builder()
            .inode(InodeSpec::stream(9, vec![5; 2048]))
            .media_slack(100)
            .build();
        let extents = vol.zone_extents();
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[2].zone_type, ZONE_MEDIA);
        assert_eq!(extents[2].size, 4 + 100);
    }
}
