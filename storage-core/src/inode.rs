//! Indexed allocation on top of the buffer cache.
//!
//! An inode's on-disk form ([`InodeDisk`]) fits in exactly one sector: a
//! length, a directory flag, a magic number, 124 direct block pointers, and
//! one doubly-indirect pointer. A file's data lives in whichever sector a
//! block index resolves to, walking through zero, one, or two levels of
//! indirection depending on how far the index is past the direct range.
//!
//! The in-memory [`Inode`] adds an explicit open/deny-write accounting pair
//! on top of the disk image, and [`InodeTable`] is the process-wide list
//! that coalesces repeat opens of the same sector into the same `Inode`.

use crate::cache::BufferCache;
use keos_support::block::{BlockDevice, Sector, SectorData};
use keos_support::freemap::FreeMap;
use keos_support::sync::SpinLock;
use keos_support::{KernelError, KernelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SECTOR_SIZE: usize = 512;
/// Number of direct block pointers stored in an inode sector.
pub const N_DIRECT: usize = 124;
/// Number of sector ids packed into one indirect block.
pub const N_INDIRECT: usize = 128;
/// Marks a well-formed inode sector; "INOD" read as a little-endian u32.
const MAGIC: u32 = 0x494E_4F44;

/// Maximum file size addressable by 124 direct blocks plus a doubly
/// indirect tree of 128x128 blocks.
pub const MAX_FILE_SIZE: u64 = ((N_DIRECT + N_INDIRECT * N_INDIRECT) * SECTOR_SIZE) as u64;

bitflags::bitflags! {
    /// Flags packed into an inode's on-disk second word. Only `DIR` is
    /// occupied today; the rest of the word is reserved for future use the
    /// way the source project leaves unused PTE bits in place.
    struct InodeFlags: u32 {
        const DIR = 0b0000_0001;
    }
}

#[derive(Clone)]
struct InodeDisk {
    length: u32,
    flags: InodeFlags,
    direct: [u32; N_DIRECT],
    double_indirect: u32,
}

impl InodeDisk {
    fn empty(is_dir: bool) -> Self {
        InodeDisk {
            length: 0,
            flags: if is_dir { InodeFlags::DIR } else { InodeFlags::empty() },
            direct: [0; N_DIRECT],
            double_indirect: 0,
        }
    }

    fn is_dir(&self) -> bool {
        self.flags.contains(InodeFlags::DIR)
    }

    fn set_is_dir(&mut self, is_dir: bool) {
        self.flags.set(InodeFlags::DIR, is_dir);
    }

    fn to_bytes(&self) -> SectorData {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..12].copy_from_slice(&MAGIC.to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            let off = 12 + i * 4;
            buf[off..off + 4].copy_from_slice(&d.to_le_bytes());
        }
        let di_off = 12 + N_DIRECT * 4;
        buf[di_off..di_off + 4].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &SectorData) -> KernelResult<Self> {
        let magic = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if magic != MAGIC {
            return Err(KernelError::CorruptImage);
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let flags_bits = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let flags = InodeFlags::from_bits_truncate(flags_bits);
        let mut direct = [0u32; N_DIRECT];
        for (i, slot) in direct.iter_mut().enumerate() {
            let off = 12 + i * 4;
            *slot = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        }
        let di_off = 12 + N_DIRECT * 4;
        let double_indirect = u32::from_le_bytes(buf[di_off..di_off + 4].try_into().unwrap());
        Ok(InodeDisk {
            length,
            flags,
            direct,
            double_indirect,
        })
    }
}

struct InodeState {
    data: InodeDisk,
    deny_write_count: u32,
    removed: bool,
}

/// One open file's or directory's in-memory metadata, shared by every
/// concurrent opener of the same sector.
pub struct Inode {
    sector: Sector,
    open_count: AtomicUsize,
    state: SpinLock<InodeState>,
}

impl Inode {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn get_inumber(&self) -> u32 {
        self.sector.as_u32()
    }

    pub fn length(&self) -> u32 {
        self.state.lock().data.length
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().data.is_dir()
    }

    pub fn set_dir(&self, is_dir: bool) {
        self.state.lock().data.set_is_dir(is_dir);
    }

    pub fn deny_write(&self) {
        self.state.lock().deny_write_count += 1;
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        if state.deny_write_count > 0 {
            state.deny_write_count -= 1;
        }
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }
}

fn read_index_block<D: BlockDevice>(cache: &BufferCache<D>, sector: Sector) -> KernelResult<[u32; N_INDIRECT]> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, 0, &mut buf)?;
    let mut out = [0u32; N_INDIRECT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
    Ok(out)
}

fn write_index_block<D: BlockDevice>(
    cache: &BufferCache<D>,
    sector: Sector,
    block: &[u32; N_INDIRECT],
) -> KernelResult<()> {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, v) in block.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    cache.write(sector, 0, &buf)
}

fn zero_sector<D: BlockDevice>(cache: &BufferCache<D>, sector: Sector) -> KernelResult<()> {
    cache.write(sector, 0, &[0u8; SECTOR_SIZE])
}

/// Resolves the sector backing block index `idx` of a file, allocating it
/// (and any indirect blocks on the path to it) when `allocate` is set and
/// the slot is not yet populated. Returns `Ok(None)` for an unallocated
/// slot when `allocate` is false, the sparse-read case.
fn sector_at<D: BlockDevice, F: FreeMap>(
    cache: &BufferCache<D>,
    free_map: &F,
    disk: &mut InodeDisk,
    idx: usize,
    allocate: bool,
) -> KernelResult<Option<Sector>> {
    if idx < N_DIRECT {
        if disk.direct[idx] == 0 {
            if !allocate {
                return Ok(None);
            }
            let s = free_map.allocate().ok_or(KernelError::OutOfDisk)?;
            zero_sector(cache, s)?;
            disk.direct[idx] = s.as_u32();
        }
        return Ok(Some(Sector::new(disk.direct[idx])));
    }

    let idx = idx - N_DIRECT;
    let indirect_idx = idx / N_INDIRECT;
    let inner_idx = idx % N_INDIRECT;
    if indirect_idx >= N_INDIRECT {
        return Err(KernelError::InvalidArgument);
    }

    if disk.double_indirect == 0 {
        if !allocate {
            return Ok(None);
        }
        let s = free_map.allocate().ok_or(KernelError::OutOfDisk)?;
        zero_sector(cache, s)?;
        disk.double_indirect = s.as_u32();
    }
    let di_sector = Sector::new(disk.double_indirect);
    let mut di_block = read_index_block(cache, di_sector)?;

    if di_block[indirect_idx] == 0 {
        if !allocate {
            return Ok(None);
        }
        let s = free_map.allocate().ok_or(KernelError::OutOfDisk)?;
        zero_sector(cache, s)?;
        di_block[indirect_idx] = s.as_u32();
        write_index_block(cache, di_sector, &di_block)?;
    }
    let ind_sector = Sector::new(di_block[indirect_idx]);
    let mut ind_block = read_index_block(cache, ind_sector)?;

    if ind_block[inner_idx] == 0 {
        if !allocate {
            return Ok(None);
        }
        let s = free_map.allocate().ok_or(KernelError::OutOfDisk)?;
        zero_sector(cache, s)?;
        ind_block[inner_idx] = s.as_u32();
        write_index_block(cache, ind_sector, &ind_block)?;
    }
    Ok(Some(Sector::new(ind_block[inner_idx])))
}

fn grow<D: BlockDevice, F: FreeMap>(
    cache: &BufferCache<D>,
    free_map: &F,
    disk: &mut InodeDisk,
    target_len: u32,
) -> KernelResult<()> {
    let blocks_needed = (target_len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;
    for idx in 0..blocks_needed {
        sector_at(cache, free_map, disk, idx, true)?;
    }
    Ok(())
}

fn write_disk<D: BlockDevice>(cache: &BufferCache<D>, sector: Sector, disk: &InodeDisk) -> KernelResult<()> {
    cache.write(sector, 0, &disk.to_bytes())
}

fn read_disk<D: BlockDevice>(cache: &BufferCache<D>, sector: Sector) -> KernelResult<InodeDisk> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, 0, &mut buf)?;
    InodeDisk::from_bytes(&buf)
}

/// The process-wide open-inode list: at most one live [`Inode`] per sector.
pub struct InodeTable<D: BlockDevice, F: FreeMap> {
    cache: Arc<BufferCache<D>>,
    free_map: Arc<F>,
    open: SpinLock<HashMap<Sector, Arc<Inode>>>,
}

impl<D: BlockDevice + 'static, F: FreeMap + 'static> InodeTable<D, F> {
    pub fn new(cache: Arc<BufferCache<D>>, free_map: Arc<F>) -> Self {
        InodeTable {
            cache,
            free_map,
            open: SpinLock::new(HashMap::new()),
        }
    }

    /// Formats a new inode at `sector`: allocates and zeroes whatever data
    /// sectors `length` requires, then writes the inode sector itself.
    pub fn create(&self, sector: Sector, length: u32, is_dir: bool) -> KernelResult<()> {
        let mut disk = InodeDisk::empty(is_dir);
        grow(&self.cache, &*self.free_map, &mut disk, length)?;
        disk.length = length;
        write_disk(&self.cache, sector, &disk)
    }

    /// Opens the inode at `sector`, reusing the shared in-memory instance
    /// if another caller already has it open.
    pub fn open(&self, sector: Sector) -> KernelResult<Arc<Inode>> {
        let mut open = self.open.lock();
        if let Some(inode) = open.get(&sector) {
            inode.open_count.fetch_add(1, Ordering::SeqCst);
            return Ok(inode.clone());
        }
        let disk = read_disk(&self.cache, sector)?;
        let inode = Arc::new(Inode {
            sector,
            open_count: AtomicUsize::new(1),
            state: SpinLock::new(InodeState {
                data: disk,
                deny_write_count: 0,
                removed: false,
            }),
        });
        open.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Bumps the open count of an already-open inode, for a second file
    /// handle onto the same file.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.open_count.fetch_add(1, Ordering::SeqCst);
        inode.clone()
    }

    /// Marks an inode for deletion. Sectors are not reclaimed until the
    /// last opener closes it.
    pub fn remove(&self, inode: &Inode) {
        inode.state.lock().removed = true;
    }

    /// Drops one opener's reference. When the open count reaches zero, the
    /// inode leaves the table; if it had been removed, every sector it
    /// owns (direct, indirect, doubly-indirect, and the inode sector
    /// itself) returns to the free-map.
    pub fn close(&self, inode: Arc<Inode>) {
        if inode.open_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.open.lock().remove(&inode.sector);
        let state = inode.state.lock();
        if state.removed {
            let disk = state.data.clone();
            drop(state);
            self.release_sectors(&disk);
            self.free_map.release(inode.sector);
            self.cache.invalidate(inode.sector);
        }
    }

    fn release_sectors(&self, disk: &InodeDisk) {
        for &s in disk.direct.iter() {
            if s != 0 {
                self.release_one(Sector::new(s));
            }
        }
        if disk.double_indirect != 0 {
            let di_sector = Sector::new(disk.double_indirect);
            if let Ok(di_block) = read_index_block(&self.cache, di_sector) {
                for &ind in di_block.iter() {
                    if ind == 0 {
                        continue;
                    }
                    let ind_sector = Sector::new(ind);
                    if let Ok(ind_block) = read_index_block(&self.cache, ind_sector) {
                        for &data_s in ind_block.iter() {
                            if data_s != 0 {
                                self.release_one(Sector::new(data_s));
                            }
                        }
                    }
                    self.release_one(ind_sector);
                }
            }
            self.release_one(di_sector);
        }
    }

    fn release_one(&self, sector: Sector) {
        self.free_map.release(sector);
        self.cache.invalidate(sector);
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, truncated at the
    /// inode's current length. Unallocated (sparse) blocks within range
    /// read back as zero.
    pub fn read_at(&self, inode: &Inode, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
        let mut state = inode.state.lock();
        let length = state.data.length as usize;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(length);
        let mut pos = offset;
        let mut written = 0;
        while pos < end {
            let idx = pos / SECTOR_SIZE;
            let within = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(end - pos);
            match sector_at(&self.cache, &*self.free_map, &mut state.data, idx, false)? {
                Some(sector) => {
                    self.cache.read(sector, within, &mut buf[written..written + chunk])?;
                }
                None => {
                    buf[written..written + chunk].fill(0);
                }
            }
            pos += chunk;
            written += chunk;
        }
        Ok(written)
    }

    /// Writes `buf` at `offset`, growing the file first if the write
    /// extends past the current length. `length` is only updated after
    /// every newly required sector has been allocated and written. Growth
    /// failure (free-map exhaustion) is surfaced to the caller as
    /// `OutOfDisk`; any sectors already allocated during the attempt are
    /// not released.
    pub fn write_at(&self, inode: &Inode, buf: &[u8], offset: usize) -> KernelResult<usize> {
        let mut state = inode.state.lock();
        if state.deny_write_count > 0 {
            return Err(KernelError::Permission);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let new_len = (offset + buf.len()) as u64;
        if new_len > MAX_FILE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let new_len = new_len as u32;
        if new_len > state.data.length {
            grow(&self.cache, &*self.free_map, &mut state.data, new_len)?;
        }

        let end = offset + buf.len();
        let mut pos = offset;
        let mut read = 0;
        while pos < end {
            let idx = pos / SECTOR_SIZE;
            let within = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(end - pos);
            let sector = sector_at(&self.cache, &*self.free_map, &mut state.data, idx, true)?
                .expect("sector must exist once allocated above");
            self.cache.write(sector, within, &buf[read..read + chunk])?;
            pos += chunk;
            read += chunk;
        }

        if new_len > state.data.length {
            state.data.length = new_len;
            write_disk(&self.cache, inode.sector, &state.data)?;
        }
        Ok(read)
    }
}
