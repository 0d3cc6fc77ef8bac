//! Sector-addressed block devices.
//!
//! The buffer cache, the inode layer, and the swap store each need a block
//! device: something that reads and writes fixed-size 512-byte sectors and
//! knows its own size. In the source project that is `devices/block.c`
//! talking to a QEMU-backed disk image; here it is the [`BlockDevice`]
//! trait, with [`RamDisk`] as the reference implementation used throughout
//! the test suite.

use crate::addressing::SECTOR_SIZE;
use crate::{KernelError, KernelResult};
use std::sync::RwLock;

/// A sector number on a [`BlockDevice`]. Sector 0 is reserved by convention
/// (boot sector); the free-map lives at sector 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sector(pub u32);

impl Sector {
    pub const fn new(id: u32) -> Self {
        Sector(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// One sector's worth of bytes.
pub type SectorData = [u8; SECTOR_SIZE];

/// Abstraction over a sector-addressed storage medium.
///
/// Implementors must be `Send + Sync`: the buffer cache's write-behind and
/// read-ahead workers, and the swap store, all call into this trait from
/// background threads concurrently with foreground callers.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`, blocking the caller.
    fn read(&self, sector: Sector, buf: &mut SectorData) -> KernelResult<()>;

    /// Writes `buf` to sector `sector`, blocking the caller.
    fn write(&self, sector: Sector, buf: &SectorData) -> KernelResult<()>;

    /// Total number of addressable sectors on this device.
    fn num_sectors(&self) -> u32;
}

/// A block device backed by host memory.
///
/// This is the workhorse test double: both the file-system disk and the
/// swap device in `storage-core`'s test suite are `RamDisk`s, distinguished
/// only by which role they are constructed for.
pub struct RamDisk {
    sectors: RwLock<Vec<SectorData>>,
}

impl RamDisk {
    /// Creates a zero-filled disk with `num_sectors` sectors.
    pub fn new(num_sectors: u32) -> Self {
        RamDisk {
            sectors: RwLock::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, sector: Sector, buf: &mut SectorData) -> KernelResult<()> {
        let sectors = self.sectors.read().unwrap();
        let src = sectors
            .get(sector.as_u32() as usize)
            .ok_or(KernelError::NotFound)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &SectorData) -> KernelResult<()> {
        let mut sectors = self.sectors.write().unwrap();
        let dst = sectors
            .get_mut(sector.as_u32() as usize)
            .ok_or(KernelError::NotFound)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn num_sectors(&self) -> u32 {
        self.sectors.read().unwrap().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = RamDisk::new(4);
        let mut buf = [7u8; SECTOR_SIZE];
        disk.write(Sector::new(2), &buf).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector::new(2), &mut out).unwrap();
        assert_eq!(out, buf);
        buf = [0u8; SECTOR_SIZE];
        disk.read(Sector::new(0), &mut buf).unwrap();
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn out_of_range_sector_is_not_found() {
        let disk = RamDisk::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read(Sector::new(5), &mut buf), Err(KernelError::NotFound));
    }

    #[test]
    fn random_sectors_round_trip_their_own_pattern() {
        use rand::Rng;

        let disk = RamDisk::new(32);
        let mut rng = rand::thread_rng();
        let mut expected = vec![[0u8; SECTOR_SIZE]; 32];
        for (i, pattern) in expected.iter_mut().enumerate() {
            rng.fill(&mut pattern[..]);
            disk.write(Sector::new(i as u32), pattern).unwrap();
        }
        for (i, pattern) in expected.iter().enumerate() {
            let mut out = [0u8; SECTOR_SIZE];
            disk.read(Sector::new(i as u32), &mut out).unwrap();
            assert_eq!(&out, pattern, "sector {i} did not round-trip its pattern");
        }
    }
}
