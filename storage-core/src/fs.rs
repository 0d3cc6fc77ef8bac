//! File-system-level operations: `create`, `open`, `remove`, and the
//! per-open-file handle built on top of the inode layer.
//!
//! Directory content is, deliberately, as small a feature as the
//! `FileSystem::{create, open, remove}` surface requires: a single flat
//! root directory whose entries are `(name, sector, in_use)` triples
//! stored as ordinary file content through [`InodeTable::read_at`]/
//! [`InodeTable::write_at`]. Subdirectories are not modeled: `create`/
//! `open`/`remove` only ever take a bare name, never a path.

use crate::cache::BufferCache;
use crate::inode::{Inode, InodeTable};
use keos_support::block::{BlockDevice, Sector};
use keos_support::freemap::FreeMap;
use keos_support::{KernelError, KernelResult};
use std::sync::Arc;

const NAME_MAX: usize = 27;
const ENTRY_SIZE: usize = NAME_MAX + 4 + 1;

fn encode_entry(name: &str, sector: u32, in_use: bool) -> [u8; ENTRY_SIZE] {
    let mut buf = [0u8; ENTRY_SIZE];
    let bytes = name.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[NAME_MAX..NAME_MAX + 4].copy_from_slice(&sector.to_le_bytes());
    buf[NAME_MAX + 4] = in_use as u8;
    buf
}

fn decode_entry(buf: &[u8; ENTRY_SIZE]) -> (String, u32, bool) {
    let name_end = buf[..NAME_MAX].iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
    let name = String::from_utf8_lossy(&buf[..name_end]).into_owned();
    let sector = u32::from_le_bytes(buf[NAME_MAX..NAME_MAX + 4].try_into().unwrap());
    let in_use = buf[NAME_MAX + 4] != 0;
    (name, sector, in_use)
}

fn dir_lookup<D: BlockDevice + 'static, F: FreeMap + 'static>(
    inodes: &InodeTable<D, F>,
    dir: &Inode,
    name: &str,
) -> KernelResult<Option<Sector>> {
    let count = dir.length() as usize / ENTRY_SIZE;
    let mut buf = [0u8; ENTRY_SIZE];
    for i in 0..count {
        inodes.read_at(dir, &mut buf, i * ENTRY_SIZE)?;
        let (entry_name, sector, in_use) = decode_entry(&buf);
        if in_use && entry_name == name {
            return Ok(Some(Sector::new(sector)));
        }
    }
    Ok(None)
}

fn dir_add<D: BlockDevice + 'static, F: FreeMap + 'static>(
    inodes: &InodeTable<D, F>,
    dir: &Inode,
    name: &str,
    sector: Sector,
) -> KernelResult<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(KernelError::InvalidArgument);
    }
    let count = dir.length() as usize / ENTRY_SIZE;
    let mut buf = [0u8; ENTRY_SIZE];
    for i in 0..count {
        inodes.read_at(dir, &mut buf, i * ENTRY_SIZE)?;
        let (_, _, in_use) = decode_entry(&buf);
        if !in_use {
            inodes.write_at(dir, &encode_entry(name, sector.as_u32(), true), i * ENTRY_SIZE)?;
            return Ok(());
        }
    }
    inodes.write_at(dir, &encode_entry(name, sector.as_u32(), true), count * ENTRY_SIZE)?;
    Ok(())
}

fn dir_remove<D: BlockDevice + 'static, F: FreeMap + 'static>(
    inodes: &InodeTable<D, F>,
    dir: &Inode,
    name: &str,
) -> KernelResult<()> {
    let count = dir.length() as usize / ENTRY_SIZE;
    let mut buf = [0u8; ENTRY_SIZE];
    for i in 0..count {
        inodes.read_at(dir, &mut buf, i * ENTRY_SIZE)?;
        let (entry_name, _, in_use) = decode_entry(&buf);
        if in_use && entry_name == name {
            inodes.write_at(dir, &encode_entry("", 0, false), i * ENTRY_SIZE)?;
            return Ok(());
        }
    }
    Err(KernelError::NotFound)
}

/// The root of the on-disk layout: a buffer cache, an open-inode table,
/// and the sector holding the root directory's inode.
pub struct FileSystem<D: BlockDevice + 'static, F: FreeMap + 'static> {
    cache: Arc<BufferCache<D>>,
    free_map: Arc<F>,
    inodes: Arc<InodeTable<D, F>>,
    root_sector: Sector,
}

impl<D: BlockDevice + 'static, F: FreeMap + 'static> FileSystem<D, F> {
    /// Formats a fresh file system: creates the root directory inode at
    /// `root_sector` and returns a ready-to-use instance.
    pub fn format(device: Arc<D>, free_map: Arc<F>, root_sector: Sector) -> KernelResult<Arc<Self>> {
        let cache = BufferCache::new(device);
        let inodes = Arc::new(InodeTable::new(cache.clone(), free_map.clone()));
        inodes.create(root_sector, 0, true)?;
        Ok(Arc::new(FileSystem {
            cache,
            free_map,
            inodes,
            root_sector,
        }))
    }

    /// Mounts a file system that was previously formatted; the root
    /// directory inode at `root_sector` is assumed to already exist.
    pub fn open_existing(device: Arc<D>, free_map: Arc<F>, root_sector: Sector) -> Self {
        let cache = BufferCache::new(device);
        let inodes = Arc::new(InodeTable::new(cache.clone(), free_map.clone()));
        FileSystem {
            cache,
            free_map,
            inodes,
            root_sector,
        }
    }

    /// Starts the cache's write-behind task at `period`.
    pub fn spawn_write_behind(&self, period: std::time::Duration) -> keos_support::thread::PeriodicWorker {
        self.cache.spawn_write_behind(period)
    }

    /// Flushes every dirty cache entry. Call before tearing down the
    /// collaborator layer.
    pub fn done(&self) {
        self.cache.write_back_all();
    }

    pub fn cache(&self) -> &Arc<BufferCache<D>> {
        &self.cache
    }

    pub fn inodes(&self) -> &Arc<InodeTable<D, F>> {
        &self.inodes
    }

    /// Creates a new, empty (or `initial_size`-long) regular file named
    /// `name` in the root directory.
    pub fn create(&self, name: &str, initial_size: u32) -> KernelResult<()> {
        let root = self.inodes.open(self.root_sector)?;
        let result = (|| {
            if dir_lookup(&self.inodes, &root, name)?.is_some() {
                return Err(KernelError::InvalidArgument);
            }
            let sector = self.free_map.allocate().ok_or(KernelError::OutOfDisk)?;
            if let Err(e) = self.inodes.create(sector, initial_size, false) {
                self.free_map.release(sector);
                return Err(e);
            }
            if let Err(e) = dir_add(&self.inodes, &root, name, sector) {
                self.free_map.release(sector);
                return Err(e);
            }
            Ok(())
        })();
        self.inodes.close(root);
        result
    }

    /// Opens `name` from the root directory for reading and writing.
    pub fn open(&self, name: &str) -> KernelResult<File<D, F>> {
        let root = self.inodes.open(self.root_sector)?;
        let found = dir_lookup(&self.inodes, &root, name);
        self.inodes.close(root);
        let sector = found?.ok_or(KernelError::NotFound)?;
        let inode = self.inodes.open(sector)?;
        Ok(File::new(self.inodes.clone(), inode))
    }

    /// Removes `name` from the root directory. The underlying sectors are
    /// only reclaimed once every open handle onto the file has closed.
    pub fn remove(&self, name: &str) -> KernelResult<()> {
        let root = self.inodes.open(self.root_sector)?;
        let result = (|| {
            let sector = dir_lookup(&self.inodes, &root, name)?.ok_or(KernelError::NotFound)?;
            dir_remove(&self.inodes, &root, name)?;
            let inode = self.inodes.open(sector)?;
            self.inodes.remove(&inode);
            self.inodes.close(inode);
            Ok(())
        })();
        self.inodes.close(root);
        result
    }
}

/// A per-open-file cursor onto a shared [`Inode`].
pub struct File<D: BlockDevice + 'static, F: FreeMap + 'static> {
    inodes: Arc<InodeTable<D, F>>,
    inode: Arc<Inode>,
    position: usize,
    deny_write: bool,
}

impl<D: BlockDevice + 'static, F: FreeMap + 'static> File<D, F> {
    fn new(inodes: Arc<InodeTable<D, F>>, inode: Arc<Inode>) -> Self {
        File {
            inodes,
            inode,
            position: 0,
            deny_write: false,
        }
    }

    /// Opens a second, independent cursor onto the same underlying file —
    /// used by `mmap` so closing the original fd does not tear down the
    /// mapping.
    pub fn reopen(&self) -> Self {
        let inode = self.inodes.reopen(&self.inode);
        File {
            inodes: self.inodes.clone(),
            inode,
            position: 0,
            deny_write: false,
        }
    }

    pub fn close(self) {
        if self.deny_write {
            self.inode.allow_write();
        }
        self.inodes.close(self.inode);
    }

    /// Closes this handle's reference to the underlying inode without
    /// consuming it by value. `reopen`'s handle is shared behind an `Arc`
    /// (one clone per mapped page plus the mmap region's own bookkeeping),
    /// so no single owner can call `close(self)` on it; this decrements the
    /// same open count `close` does, by cloning the `Arc<Inode>` rather than
    /// the whole handle.
    pub fn close_ref(&self) {
        if self.deny_write {
            self.inode.allow_write();
        }
        self.inodes.close(self.inode.clone());
    }

    pub fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        let n = self.inodes.read_at(&self.inode, buf, self.position)?;
        self.position += n;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        let n = self.inodes.write_at(&self.inode, buf, self.position)?;
        self.position += n;
        Ok(n)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
        self.inodes.read_at(&self.inode, buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: usize) -> KernelResult<usize> {
        self.inodes.write_at(&self.inode, buf, offset)
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub fn tell(&self) -> usize {
        self.position
    }

    pub fn length(&self) -> u32 {
        self.inode.length()
    }

    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.inode.deny_write();
            self.deny_write = true;
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.inode.allow_write();
            self.deny_write = false;
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos_support::block::RamDisk;
    use keos_support::freemap::BitmapFreeMap;

    fn fs(num_sectors: u32) -> Arc<FileSystem<RamDisk, BitmapFreeMap>> {
        let device = Arc::new(RamDisk::new(num_sectors));
        let free_map = Arc::new(BitmapFreeMap::new(num_sectors, 2));
        FileSystem::format(device, free_map, Sector::new(1)).unwrap()
    }

    #[test]
    fn create_open_write_read_remove() {
        let fs = fs(400);
        fs.create("a.txt", 0).unwrap();
        let mut f = fs.open("a.txt").unwrap();
        f.write(b"payload").unwrap();
        f.seek(0);
        let mut out = [0u8; 7];
        f.read(&mut out).unwrap();
        assert_eq!(&out, b"payload");
        f.close();

        fs.remove("a.txt").unwrap();
        assert_eq!(fs.open("a.txt").err(), Some(KernelError::NotFound));
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let fs = fs(400);
        fs.create("dup", 0).unwrap();
        assert_eq!(fs.create("dup", 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn remove_is_deferred_until_last_handle_closes() {
        let fs = fs(400);
        fs.create("b.txt", 512).unwrap();
        let f = fs.open("b.txt").unwrap();
        fs.remove("b.txt").unwrap();
        // Existing handle still works; the sector isn't reclaimed yet.
        assert_eq!(f.length(), 512);
        f.close();
    }

    #[test]
    fn deny_write_round_trips_through_a_file_handle() {
        let fs = fs(400);
        fs.create("c.txt", 0).unwrap();
        let mut f = fs.open("c.txt").unwrap();
        f.deny_write();
        assert_eq!(f.write(b"x"), Err(KernelError::Permission));
        f.allow_write();
        assert!(f.write(b"x").is_ok());
        f.close();
    }
}
