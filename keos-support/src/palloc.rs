//! The raw physical page allocator.
//!
//! `palloc_get_page(PAL_USER)` / `palloc_free_page` in the source project;
//! [`PageAllocator`] here, with [`ArenaPageAllocator`] as a fixed-capacity
//! reference implementation. The fixed capacity is deliberate: the frame
//! table's eviction path is only exercised by tests that can actually run
//! the allocator out of pages.

use crate::addressing::{Pa, PGSIZE};
use std::sync::Mutex;

/// Abstraction over the system's physical-page allocator.
pub trait PageAllocator: Send + Sync {
    /// Hands out one fresh, zero-filled user page, or `None` if none remain.
    fn get_user_page(&self) -> Option<Pa>;

    /// Returns a page previously obtained from [`get_user_page`].
    fn free_page(&self, page: Pa);

    /// Reads the contents of a page.
    fn read_page(&self, page: Pa) -> [u8; PGSIZE];

    /// Overwrites the contents of a page.
    fn write_page(&self, page: Pa, data: &[u8; PGSIZE]);
}

struct Arena {
    storage: Vec<Box<[u8; PGSIZE]>>,
    free: Vec<usize>,
}

/// A [`PageAllocator`] over a fixed number of host-backed pages.
pub struct ArenaPageAllocator {
    inner: Mutex<Arena>,
}

impl ArenaPageAllocator {
    /// Creates an allocator with room for `capacity` simultaneously live
    /// pages.
    pub fn new(capacity: usize) -> Self {
        let storage: Vec<Box<[u8; PGSIZE]>> =
            (0..capacity).map(|_| Box::new([0u8; PGSIZE])).collect();
        let free = (0..capacity).collect();
        ArenaPageAllocator {
            inner: Mutex::new(Arena { storage, free }),
        }
    }

    /// Total capacity, for tests that want to exhaust the arena precisely.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().storage.len()
    }

    /// Number of pages currently handed out.
    pub fn in_use(&self) -> usize {
        let arena = self.inner.lock().unwrap();
        arena.storage.len() - arena.free.len()
    }
}

impl PageAllocator for ArenaPageAllocator {
    fn get_user_page(&self) -> Option<Pa> {
        let mut arena = self.inner.lock().unwrap();
        let idx = arena.free.pop()?;
        arena.storage[idx].fill(0);
        Some(Pa(idx))
    }

    fn free_page(&self, page: Pa) {
        let mut arena = self.inner.lock().unwrap();
        let idx = page.as_usize();
        debug_assert!(idx < arena.storage.len());
        arena.free.push(idx);
    }

    fn read_page(&self, page: Pa) -> [u8; PGSIZE] {
        let arena = self.inner.lock().unwrap();
        *arena.storage[page.as_usize()]
    }

    fn write_page(&self, page: Pa, data: &[u8; PGSIZE]) {
        let mut arena = self.inner.lock().unwrap();
        arena.storage[page.as_usize()].copy_from_slice(data);
    }
}
