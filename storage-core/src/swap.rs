//! The swap store: bitmap-allocated, page-sized slots on a dedicated block
//! device, used to spill anonymous and (briefly) file-backed pages out of
//! physical memory.
//!
//! A slot is `PGSIZE / SECTOR_SIZE` consecutive sectors on the swap
//! device; `slot_count = device.num_sectors() / SECTORS_PER_PAGE`. All
//! three operations below hold [`SwapStore`]'s single lock for the
//! duration of the bitmap update and the device I/O — unlike the buffer
//! cache, there is no finer-grained entry lock here, since a slot is only
//! ever touched by the one page that owns it.

use keos_support::addressing::{PGSIZE, SECTORS_PER_PAGE};
use keos_support::block::{BlockDevice, Sector};
use keos_support::sync::SpinLock;
use keos_support::{KernelError, KernelResult};

/// One swap slot's identity: an index into the bitmap, not a sector
/// number (multiply by `SECTORS_PER_PAGE` to get the first sector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(pub u32);

struct Inner {
    bitmap: Vec<bool>,
}

/// A dedicated block device sliced into page-sized, bitmap-tracked slots.
pub struct SwapStore<D: BlockDevice> {
    device: D,
    inner: SpinLock<Inner>,
}

impl<D: BlockDevice> SwapStore<D> {
    pub fn new(device: D) -> Self {
        let slot_count = device.num_sectors() as usize / SECTORS_PER_PAGE;
        SwapStore {
            device,
            inner: SpinLock::new(Inner {
                bitmap: vec![false; slot_count],
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().bitmap.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.inner.lock().bitmap.iter().filter(|b| **b).count()
    }

    /// Writes one page of data into a freshly allocated slot, returning
    /// its id. Fails with `OutOfSwap` when the bitmap has no free slot —
    /// per the design, this is treated as fatal by callers, matching the
    /// source system's behavior when swap is exhausted.
    pub fn write_out(&self, page: &[u8; PGSIZE]) -> KernelResult<SwapSlot> {
        let slot = {
            let mut inner = self.inner.lock();
            let idx = inner.bitmap.iter().position(|b| !*b).ok_or(KernelError::OutOfSwap)?;
            inner.bitmap[idx] = true;
            idx
        };
        if let Err(e) = self.write_slot(slot, page) {
            self.inner.lock().bitmap[slot] = false;
            return Err(e);
        }
        Ok(SwapSlot(slot as u32))
    }

    /// Reads a slot's page back and frees it — a swap-in always consumes
    /// its slot, matching `swap_in`'s "frees the slot, clears swap index".
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8; PGSIZE]) -> KernelResult<()> {
        self.read_slot(slot.0 as usize, page)?;
        self.free(slot);
        Ok(())
    }

    /// Releases a slot without reading it, used when a swapped page is
    /// discarded (e.g. process exit) rather than brought back in.
    pub fn free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        if let Some(b) = inner.bitmap.get_mut(slot.0 as usize) {
            *b = false;
        }
    }

    fn write_slot(&self, slot: usize, page: &[u8; PGSIZE]) -> KernelResult<()> {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; 512];
            let off = i * 512;
            buf.copy_from_slice(&page[off..off + 512]);
            self.device.write(Sector::new(base + i as u32), &buf)?;
        }
        Ok(())
    }

    fn read_slot(&self, slot: usize, page: &mut [u8; PGSIZE]) -> KernelResult<()> {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; 512];
            self.device.read(Sector::new(base + i as u32), &mut buf)?;
            let off = i * 512;
            page[off..off + 512].copy_from_slice(&buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos_support::block::RamDisk;

    fn store(pages: u32) -> SwapStore<RamDisk> {
        SwapStore::new(RamDisk::new(pages * SECTORS_PER_PAGE as u32))
    }

    #[test]
    fn write_out_then_read_in_round_trips_and_frees_the_slot() {
        let s = store(4);
        let mut page = [0u8; PGSIZE];
        page[0] = 1;
        page[PGSIZE - 1] = 2;
        let slot = s.write_out(&page).unwrap();
        assert_eq!(s.occupied_count(), 1);
        let mut back = [0u8; PGSIZE];
        s.read_in(slot, &mut back).unwrap();
        assert_eq!(back, page);
        assert_eq!(s.occupied_count(), 0);
    }

    #[test]
    fn exhaustion_reports_out_of_swap() {
        let s = store(1);
        let page = [0u8; PGSIZE];
        let _slot = s.write_out(&page).unwrap();
        assert_eq!(s.write_out(&page), Err(KernelError::OutOfSwap));
    }

    #[test]
    fn free_without_read_returns_slot_to_the_bitmap() {
        let s = store(2);
        let page = [9u8; PGSIZE];
        let slot = s.write_out(&page).unwrap();
        s.free(slot);
        assert_eq!(s.occupied_count(), 0);
    }
}
