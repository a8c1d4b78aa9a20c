//! Sector-addressed device access.
//!
//! Everything the engine moves is counted in 512-byte sectors; a
//! [`BlockDevice`] is the narrow seam between the engine and whatever is
//! actually holding those sectors (a raw disk, a partition node, or an
//! in-memory image in tests).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{Error, Result};

/// The minimal unit of transfer, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector-granular read/write access to one device.
pub trait BlockDevice {
    /// Total number of sectors on the device.
    fn sectors(&self) -> u64;

    /// Read `buf.len() / 512` sectors starting at `sector`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / 512` sectors starting at `sector`.
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()>;
}

/// A device backed by a file or a raw block device node.
pub struct FileDevice {
    file: File,
    sectors: u64,
}

impl FileDevice {
    /// Open a device read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::Init {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_file(file)
    }

    /// Open a device for writing (restore targets).
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Init {
                reason: format!("{}: {}", path.display(), e),
            })?;
        Self::from_file(file)
    }

    fn from_file(mut file: File) -> Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file,
            sectors: len / SECTOR_SIZE as u64,
        })
    }
}

impl BlockDevice for FileDevice {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % SECTOR_SIZE, 0);
        self.file
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % SECTOR_SIZE, 0);
        self.file
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

/// An in-memory device, used by the synthetic volume and by tests.
#[derive(Clone)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len() % SECTOR_SIZE, 0);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(crate::StreamError::ShortRead {
                sector,
                count: (buf.len() / SECTOR_SIZE) as u32,
            }
            .into());
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(crate::StreamError::ShortWrite {
                sector,
                count: (buf.len() / SECTOR_SIZE) as u32,
            }
            .into());
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_sectors() {
        let mut dev = MemDevice::new(4);
        let block = [0xa5u8; SECTOR_SIZE];
        dev.write_sectors(2, &block).unwrap();

        let mut back = [0u8; SECTOR_SIZE];
        dev.read_sectors(2, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let mut dev = MemDevice::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(dev.read_sectors(5, &mut buf).is_err());
    }

    #[test]
    fn file_device_reports_sector_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; SECTOR_SIZE * 8]).unwrap();
        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.sectors(), 8);
    }
}
