//! The buffer cache: an in-memory mirror of disk sectors.
//!
//! Every other component that touches disk — the inode layer directly, the
//! swap store and the page-fault handler indirectly through the inode layer
//! — goes through here rather than calling the block device on its own.
//! That gives the whole crate one place that enforces "at most one resident
//! copy of a sector" and one place that can coalesce repeated small writes
//! into a single write-behind flush.
//!
//! ## Locking
//!
//! A single `global` lock protects the *index* — which sector lives in
//! which slot — for lookup and allocation decisions. Each slot additionally
//! has its own lock protecting its 512 bytes and dirty bit. The global lock
//! is held only long enough to decide which slot a caller will use; the
//! slot's own lock is acquired *before* the global lock is released (a
//! hand-off), and is then held alone across any block-device I/O. This is
//! what lets two callers operate on two different sectors concurrently
//! without serializing on disk I/O.
//!
//! ## Eviction
//!
//! When every slot is occupied, [`Inner::evict_locked`] runs a
//! second-chance scan: walk the slots in order, taking a non-blocking lock
//! on each. A set `second_chance` bit is cleared and the slot skipped; the
//! first slot found already cleared is the victim. The scan repeats up to
//! ten full passes; finding no victim after that is treated as fatal — a
//! production kernel would block and retry, but an eviction that fails
//! after ten full passes means every slot is pinned by a live call, and
//! retrying here would just spin forever on the same deadlock.

use crossbeam_queue::SegQueue;
use keos_support::block::{BlockDevice, Sector, SectorData};
use keos_support::sync::SpinLock;
use keos_support::thread::PeriodicWorker;
use keos_support::KernelResult;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Number of resident sectors the cache holds at once.
pub const CACHE_SIZE: usize = 64;

/// Maximum number of full second-chance scans before eviction gives up.
const MAX_EVICT_PASSES: usize = 10;

struct Entry {
    sector: Option<Sector>,
    data: SectorData,
    dirty: bool,
    second_chance: bool,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            sector: None,
            data: [0u8; 512],
            dirty: false,
            second_chance: false,
        }
    }
}

struct Inner {
    /// Maps a resident sector to the slot currently holding it. A slot
    /// index absent from every value here is UNUSED.
    index: HashMap<Sector, usize>,
}

impl Inner {
    fn free_slot(&self) -> Option<usize> {
        let occupied: HashSet<usize> = self.index.values().copied().collect();
        (0..CACHE_SIZE).find(|i| !occupied.contains(i))
    }

    /// Runs the second-chance scan, flushing and reclaiming one slot.
    /// Panics if no victim is found within `MAX_EVICT_PASSES` full passes.
    fn evict_locked<D: BlockDevice>(&mut self, entries: &[SpinLock<Entry>], device: &D) -> usize {
        for _pass in 0..MAX_EVICT_PASSES {
            for (idx, slot) in entries.iter().enumerate() {
                let Some(mut guard) = slot.try_lock() else {
                    continue;
                };
                if guard.sector.is_none() {
                    continue;
                }
                if guard.second_chance {
                    guard.second_chance = false;
                    continue;
                }
                let sector = guard.sector.take().expect("victim must be occupied");
                if guard.dirty {
                    device
                        .write(sector, &guard.data)
                        .expect("block device write failed during eviction");
                    guard.dirty = false;
                }
                self.index.remove(&sector);
                return idx;
            }
        }
        panic!(
            "buffer cache eviction failed after {} passes: every slot pinned",
            MAX_EVICT_PASSES
        );
    }
}

/// The read-ahead queue and the semaphore-style wake signal for its worker.
///
/// The queue itself is a [`SegQueue`], a lock-free MPSC-friendly structure —
/// foreground callers push from any thread while holding no lock of their
/// own, and the one background worker pops. The `park`/`wake` pair is just
/// the condvar the worker blocks on between pushes; it guards nothing but an
/// empty tuple.
struct ReadAhead {
    pending: SegQueue<Sector>,
    park: Mutex<()>,
    wake: Condvar,
}

impl ReadAhead {
    fn new() -> Self {
        ReadAhead {
            pending: SegQueue::new(),
            park: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Enqueues `sector`. A sector already queued (or already resident) may
    /// be enqueued again; the worker's `locate` is a harmless no-op in that
    /// case — read-ahead is advisory, and a redundant fetch is silent.
    fn push(&self, sector: Sector) {
        self.pending.push(sector);
        self.wake.notify_one();
    }
}

/// The buffer cache. One instance backs one block device (the file-system
/// disk, typically); the swap store uses its own device directly and does
/// not go through a `BufferCache`, since swap slots are never partially
/// read or written the way file sectors are.
pub struct BufferCache<D: BlockDevice> {
    device: Arc<D>,
    global: SpinLock<Inner>,
    entries: Vec<SpinLock<Entry>>,
    readahead: ReadAhead,
    shutdown: Arc<AtomicBool>,
}

impl<D: BlockDevice + 'static> BufferCache<D> {
    /// Builds a cache over `device` and spawns its read-ahead worker.
    /// Call [`BufferCache::spawn_write_behind`] separately to start the
    /// periodic flush task — the two are independent so tests can drive
    /// write-behind on a short period without waiting on it at
    /// construction time.
    pub fn new(device: Arc<D>) -> Arc<Self> {
        let cache = Arc::new(BufferCache {
            device,
            global: SpinLock::new(Inner { index: HashMap::new() }),
            entries: (0..CACHE_SIZE).map(|_| SpinLock::new(Entry::empty())).collect(),
            readahead: ReadAhead::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        cache.clone().spawn_readahead_worker();
        cache
    }

    fn spawn_readahead_worker(self: Arc<Self>) {
        std::thread::Builder::new()
            .name("cache-readahead".to_string())
            .spawn(move || loop {
                let sector = loop {
                    if let Some(s) = self.readahead.pending.pop() {
                        break s;
                    }
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let guard = self.readahead.park.lock().unwrap();
                    let _ = self.readahead.wake.wait_timeout(guard, Duration::from_millis(50)).unwrap();
                };
                // Advisory only: ignore device errors and the common case
                // where another caller already loaded it. On a genuine miss
                // the entry must actually be filled from disk here — the
                // same load `read`/`write` perform on their own miss path —
                // or the slot would sit resident with zeroed, stale data.
                let (_idx, mut guard, was_miss) = self.locate(sector);
                if was_miss {
                    let _ = self.device.read(sector, &mut guard.data);
                }
            })
            .expect("failed to spawn read-ahead worker");
    }

    /// Starts the periodic write-behind flush. Returns the worker handle;
    /// dropping or calling `shutdown()` on it performs one final flush.
    pub fn spawn_write_behind(self: &Arc<Self>, period: Duration) -> PeriodicWorker {
        let cache = self.clone();
        PeriodicWorker::spawn("cache-write-behind", period, move || {
            cache.write_back_all();
        })
    }

    /// Runs the lookup/allocate/evict decision under the global lock,
    /// hands off into the chosen slot's lock, and releases the global
    /// lock. Returns the slot index, a guard on it, and whether this was a
    /// miss (meaning the caller must load the sector from `device`).
    fn locate(&self, sector: Sector) -> (usize, MutexGuard<'_, Entry>, bool) {
        let mut global = self.global.lock();
        if let Some(&idx) = global.index.get(&sector) {
            let guard = self.entries[idx].lock();
            return (idx, guard, false);
        }
        let idx = global
            .free_slot()
            .unwrap_or_else(|| global.evict_locked(&self.entries, &*self.device));
        global.index.insert(sector, idx);
        let mut guard = self.entries[idx].lock();
        guard.sector = Some(sector);
        guard.dirty = false;
        guard.second_chance = true;
        (idx, guard, true)
    }

    /// Reads `size` bytes at `offset` within `sector` into `dst`.
    pub fn read(&self, sector: Sector, offset: usize, dst: &mut [u8]) -> KernelResult<()> {
        let size = dst.len();
        assert!(offset + size <= 512, "read past sector end");
        let (_idx, mut guard, was_miss) = self.locate(sector);
        if was_miss {
            self.device.read(sector, &mut guard.data)?;
        }
        dst.copy_from_slice(&guard.data[offset..offset + size]);
        guard.second_chance = true;
        drop(guard);
        self.readahead.push(Sector::new(sector.as_u32() + 1));
        Ok(())
    }

    /// Writes `src` into `sector` at `offset`. If `src` does not cover the
    /// whole sector and the sector was not already resident, the untouched
    /// bytes are first loaded from disk so a partial write can never
    /// silently zero the rest of the sector.
    pub fn write(&self, sector: Sector, offset: usize, src: &[u8]) -> KernelResult<()> {
        let size = src.len();
        assert!(offset + size <= 512, "write past sector end");
        let (_idx, mut guard, was_miss) = self.locate(sector);
        if was_miss && size < 512 {
            self.device.read(sector, &mut guard.data)?;
        }
        guard.data[offset..offset + size].copy_from_slice(src);
        guard.dirty = true;
        guard.second_chance = true;
        Ok(())
    }

    /// Flushes every dirty resident sector to the underlying device.
    pub fn write_back_all(&self) {
        for slot in self.entries.iter() {
            let mut guard = slot.lock();
            if let Some(sector) = guard.sector {
                if guard.dirty {
                    if self.device.write(sector, &guard.data).is_ok() {
                        guard.dirty = false;
                    }
                }
            }
        }
    }

    /// Drops a sector from the cache without writing it back, used when
    /// the file system frees the sector and stale data should not survive
    /// a later reallocation.
    pub fn invalidate(&self, sector: Sector) {
        let mut global = self.global.lock();
        if let Some(idx) = global.index.remove(&sector) {
            let mut guard = self.entries[idx].lock();
            guard.sector = None;
            guard.dirty = false;
        }
    }

    /// Signals background workers to stop. Call before dropping the cache
    /// to avoid leaking the read-ahead thread in tests.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
