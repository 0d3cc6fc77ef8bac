//! The frame table: tracks which physical pages are in use and by whom,
//! and runs second-chance eviction when the raw allocator is exhausted.
//!
//! A `Frame` does not know how to swap its own contents out — that
//! requires knowing whether the page is file-backed or anonymous, which
//! is [`crate::vm`]'s business, not this module's. Instead, whoever calls
//! [`FrameTable::alloc`] supplies an `on_evict` callback that performs
//! whatever the owning supplemental page table needs (swap-out, or a
//! writeback through the file system) before the frame is actually
//! reclaimed. This keeps the frame table's own state — insertion order,
//! the use bit, the owner — independent of the page-source enum one layer
//! up.

use keos_support::addressing::{Pa, Va};
use keos_support::pagedir::PageDirectory;
use keos_support::palloc::PageAllocator;
use keos_support::sync::SpinLock;
use keos_support::{KernelError, KernelResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies the process that owns a frame. Owner `0` is reserved for
/// kernel-owned frames, which eviction never selects as a victim.
pub type Owner = u64;

type EvictFn = dyn Fn(Va) -> KernelResult<()> + Send + Sync;

struct Frame {
    owner: Owner,
    uva: Va,
    pagedir: Arc<dyn PageDirectory>,
    on_evict: Arc<EvictFn>,
    use_bit: bool,
}

struct Inner {
    order: Vec<Pa>,
    frames: HashMap<Pa, Frame>,
}

/// The physical-frame tracker, generic over the raw page allocator it
/// draws from.
pub struct FrameTable<A: PageAllocator> {
    allocator: Arc<A>,
    inner: SpinLock<Inner>,
}

impl<A: PageAllocator> FrameTable<A> {
    pub fn new(allocator: Arc<A>) -> Self {
        FrameTable {
            allocator,
            inner: SpinLock::new(Inner {
                order: Vec::new(),
                frames: HashMap::new(),
            }),
        }
    }

    /// Obtains a fresh physical page for `uva`, owned by `owner`. On
    /// allocator exhaustion, runs eviction once and retries; a second
    /// failure is reported as `OutOfMemory`.
    pub fn alloc(
        &self,
        owner: Owner,
        uva: Va,
        pagedir: Arc<dyn PageDirectory>,
        on_evict: Arc<EvictFn>,
    ) -> KernelResult<Pa> {
        let mut inner = self.inner.lock();
        let pa = match self.allocator.get_user_page() {
            Some(pa) => pa,
            None => {
                self.evict_locked(&mut inner)?;
                self.allocator.get_user_page().ok_or(KernelError::OutOfMemory)?
            }
        };
        inner.order.push(pa);
        inner.frames.insert(
            pa,
            Frame {
                owner,
                uva,
                pagedir,
                on_evict,
                use_bit: true,
            },
        );
        Ok(pa)
    }

    /// Marks `pa` as recently used, clearing it from eviction's next
    /// second-chance pass. The fault handler calls this whenever it
    /// materializes a page, standing in for the hardware access bit.
    pub fn touch(&self, pa: Pa) {
        if let Some(frame) = self.inner.lock().frames.get_mut(&pa) {
            frame.use_bit = true;
        }
    }

    /// Releases a frame directly (not via eviction): clears its
    /// page-table mapping and returns the physical page to the allocator.
    pub fn free(&self, pa: Pa) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.remove(&pa) {
            inner.order.retain(|p| *p != pa);
            frame.pagedir.clear_page(frame.uva);
            self.allocator.free_page(pa);
        }
    }

    pub fn owner_of(&self, pa: Pa) -> Option<Owner> {
        self.inner.lock().frames.get(&pa).map(|f| f.owner)
    }

    /// Number of frames currently tracked, for tests that check a
    /// process's frames were fully released after exit.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, inner: &mut Inner) -> KernelResult<()> {
        if inner.order.is_empty() {
            return Err(KernelError::OutOfMemory);
        }
        let mut i = 0;
        let scan_limit = inner.order.len() * 2 + 1;
        for _ in 0..scan_limit {
            if inner.order.is_empty() {
                return Err(KernelError::OutOfMemory);
            }
            let idx = i % inner.order.len();
            let pa = inner.order[idx];
            let owner = inner.frames.get(&pa).map(|f| f.owner).unwrap_or(0);
            if owner == 0 {
                i += 1;
                continue;
            }
            let use_bit = inner.frames.get(&pa).map(|f| f.use_bit).unwrap_or(false);
            if use_bit {
                inner.frames.get_mut(&pa).unwrap().use_bit = false;
                i += 1;
                continue;
            }
            let frame = inner.frames.remove(&pa).expect("victim must be tracked");
            inner.order.remove(idx);
            (frame.on_evict)(frame.uva)?;
            frame.pagedir.clear_page(frame.uva);
            self.allocator.free_page(pa);
            return Ok(());
        }
        Err(KernelError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keos_support::palloc::ArenaPageAllocator;
    use keos_support::pagedir::TestPageDirectory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn alloc_evicts_when_allocator_is_exhausted() {
        let allocator = Arc::new(ArenaPageAllocator::new(1));
        let table = FrameTable::new(allocator);
        let pagedir: Arc<dyn PageDirectory> = Arc::new(TestPageDirectory::new());
        let evictions = Arc::new(AtomicUsize::new(0));

        let first = table
            .alloc(1, Va::new(0x1000), pagedir.clone(), {
                let evictions = evictions.clone();
                Arc::new(move |_uva| {
                    evictions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(table.len(), 1);

        let second = table
            .alloc(1, Va::new(0x2000), pagedir.clone(), Arc::new(|_uva| Ok(())))
            .unwrap();
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
        assert_ne!(first, second);
    }

    #[test]
    fn free_clears_the_page_directory_mapping() {
        let allocator = Arc::new(ArenaPageAllocator::new(2));
        let table = FrameTable::new(allocator);
        let pagedir = Arc::new(TestPageDirectory::new());
        let pd_dyn: Arc<dyn PageDirectory> = pagedir.clone();
        let va = Va::new(0x4000);
        let pa = table.alloc(1, va, pd_dyn, Arc::new(|_| Ok(()))).unwrap();
        pagedir.set_page(va, pa, true);
        assert!(pagedir.get_page(va).is_some());
        table.free(pa);
        assert!(pagedir.get_page(va).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn kernel_owned_frames_are_never_evicted() {
        let allocator = Arc::new(ArenaPageAllocator::new(1));
        let table = FrameTable::new(allocator);
        let pagedir: Arc<dyn PageDirectory> = Arc::new(TestPageDirectory::new());
        let _kernel_frame = table.alloc(0, Va::new(0x1000), pagedir.clone(), Arc::new(|_| Ok(()))).unwrap();
        let result = table.alloc(1, Va::new(0x2000), pagedir, Arc::new(|_| Ok(())));
        assert_eq!(result, Err(KernelError::OutOfMemory));
    }
}
