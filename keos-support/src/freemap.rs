//! The directory layer's sector allocator.
//!
//! The inode layer grows files by asking an external allocator for sectors;
//! it never scans the disk itself. The source project calls this the
//! free-map (a bitmap persisted at a fixed sector); [`FreeMap`] is the trait
//! the inode layer is written against, and [`BitmapFreeMap`] is the
//! in-memory reference implementation.

use crate::block::Sector;

/// An allocator of disk sectors, backing the inode layer's growth.
///
/// Implementors must be `Send + Sync`: multiple inodes may grow
/// concurrently under their own inode locks, each calling into the shared
/// free-map.
pub trait FreeMap: Send + Sync {
    /// Allocates `n` contiguous-in-*numbering*-only (not necessarily
    /// contiguous on disk) sectors is not required here: the inode layer
    /// allocates one sector at a time, so this always allocates exactly
    /// one and returns its id, or `None` if the map is exhausted.
    fn allocate(&self) -> Option<Sector>;

    /// Returns a previously allocated sector to the free pool.
    fn release(&self, sector: Sector);
}

/// A bitmap-backed [`FreeMap`] over a fixed number of sectors.
pub struct BitmapFreeMap {
    bits: std::sync::Mutex<Vec<bool>>,
}

impl BitmapFreeMap {
    /// Creates a free-map over `num_sectors` sectors, with `reserved`
    /// leading sectors (boot sector, free-map sector, root-directory
    /// sector, ...) pre-marked as occupied.
    pub fn new(num_sectors: u32, reserved: u32) -> Self {
        let mut bits = vec![false; num_sectors as usize];
        for b in bits.iter_mut().take(reserved as usize) {
            *b = true;
        }
        BitmapFreeMap {
            bits: std::sync::Mutex::new(bits),
        }
    }

    /// Number of sectors currently marked occupied. Exposed for tests that
    /// check the bitmap returns to its prior state after frees.
    pub fn occupied_count(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|b| **b).count()
    }
}

impl FreeMap for BitmapFreeMap {
    fn allocate(&self) -> Option<Sector> {
        let mut bits = self.bits.lock().unwrap();
        let idx = bits.iter().position(|b| !*b)?;
        bits[idx] = true;
        Some(Sector::new(idx as u32))
    }

    fn release(&self, sector: Sector) {
        let mut bits = self.bits.lock().unwrap();
        if let Some(b) = bits.get_mut(sector.as_u32() as usize) {
            *b = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_skips_reserved_and_reuses_released() {
        let map = BitmapFreeMap::new(4, 2);
        let a = map.allocate().unwrap();
        assert_eq!(a, Sector::new(2));
        let b = map.allocate().unwrap();
        assert_eq!(b, Sector::new(3));
        assert!(map.allocate().is_none());
        map.release(a);
        assert_eq!(map.allocate(), Some(Sector::new(2)));
    }
}
