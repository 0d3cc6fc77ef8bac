//! The supplemental page table, the page-fault handler, and `mmap`/`munmap`.
//!
//! This is the component that ties every other piece of the crate
//! together: a page's [`Source`] decides whether materializing it means
//! reading from a file (through [`crate::fs::File`], hence through the
//! buffer cache), reading from swap, or simply zeroing a fresh frame.
//! Eviction is driven from here too — [`SupplementalPageTable::new`]
//! builds the `on_evict` closure handed to [`FrameTable::alloc`], since
//! only this layer knows what "evict this page" means for a given source.

use crate::fs::File;
use crate::frame::{FrameTable, Owner};
use crate::swap::{SwapSlot, SwapStore};
use keos_support::addressing::{Pa, Va, PGSIZE, PHYS_BASE, STACK_LIMIT};
use keos_support::block::BlockDevice;
use keos_support::freemap::FreeMap;
use keos_support::pagedir::PageDirectory;
use keos_support::palloc::PageAllocator;
use keos_support::sync::SpinLock;
use keos_support::{KernelError, KernelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const STACK_WINDOW_LOW: usize = PHYS_BASE - STACK_LIMIT;

fn in_stack_window(fault_addr: Va, saved_sp: Va) -> bool {
    fault_addr.as_usize() >= STACK_WINDOW_LOW && fault_addr.as_usize() + 32 >= saved_sp.as_usize()
}

/// What a supplemental page's contents come from when it is not resident.
pub enum Source<D: BlockDevice + 'static, Fm: FreeMap + 'static> {
    ZeroFill,
    FileBacked { file: Arc<File<D, Fm>>, offset: u64, bytes: usize },
    Swapped { slot: SwapSlot },
}

fn clone_source<D: BlockDevice + 'static, Fm: FreeMap + 'static>(source: &Source<D, Fm>) -> Source<D, Fm> {
    match source {
        Source::ZeroFill => Source::ZeroFill,
        Source::FileBacked { file, offset, bytes } => Source::FileBacked {
            file: file.clone(),
            offset: *offset,
            bytes: *bytes,
        },
        Source::Swapped { slot } => Source::Swapped { slot: *slot },
    }
}

/// One user virtual page's description, resident or not.
pub struct Page<D: BlockDevice + 'static, Fm: FreeMap + 'static> {
    writable: bool,
    in_stack: bool,
    frame: Option<Pa>,
    source: Source<D, Fm>,
}

struct MmapRegion<D: BlockDevice + 'static, Fm: FreeMap + 'static> {
    base: Va,
    file: Arc<File<D, Fm>>,
    page_count: usize,
}

/// A single process's view of its virtual address space: which pages
/// exist, where their contents currently live, and the bookkeeping for
/// its memory-mapped files.
pub struct SupplementalPageTable<
    D: BlockDevice + 'static,
    Fm: FreeMap + 'static,
    A: PageAllocator + 'static,
    Sd: BlockDevice + 'static,
> {
    owner: Owner,
    pagedir: Arc<dyn PageDirectory>,
    frames: Arc<FrameTable<A>>,
    allocator: Arc<A>,
    swap: Arc<SwapStore<Sd>>,
    pages: Arc<SpinLock<HashMap<Va, Page<D, Fm>>>>,
    mmaps: SpinLock<HashMap<u32, MmapRegion<D, Fm>>>,
    next_mmap_id: AtomicU32,
}

impl<D: BlockDevice + 'static, Fm: FreeMap + 'static, A: PageAllocator + 'static, Sd: BlockDevice + 'static>
    SupplementalPageTable<D, Fm, A, Sd>
{
    pub fn new(
        owner: Owner,
        pagedir: Arc<dyn PageDirectory>,
        frames: Arc<FrameTable<A>>,
        allocator: Arc<A>,
        swap: Arc<SwapStore<Sd>>,
    ) -> Self {
        SupplementalPageTable {
            owner,
            pagedir,
            frames,
            allocator,
            swap,
            pages: Arc::new(SpinLock::new(HashMap::new())),
            mmaps: SpinLock::new(HashMap::new()),
            next_mmap_id: AtomicU32::new(0),
        }
    }

    /// Registers a file-backed page without materializing it; used by the
    /// loader to lay out a program's segments before any fault occurs.
    pub fn map_file_backed(&self, va: Va, file: Arc<File<D, Fm>>, offset: u64, bytes: usize, writable: bool) {
        let va = va.round_down();
        self.pages.lock().insert(
            va,
            Page {
                writable,
                in_stack: false,
                frame: None,
                source: Source::FileBacked { file, offset, bytes },
            },
        );
    }

    /// Eagerly materializes a zero-filled stack page at `va`, for a
    /// process setting up its initial stack rather than faulting into it.
    pub fn create_stack_page(&self, va: Va) -> KernelResult<()> {
        let va = va.round_down();
        {
            let mut pages = self.pages.lock();
            if pages.contains_key(&va) {
                return Err(KernelError::InvalidArgument);
            }
            pages.insert(
                va,
                Page {
                    writable: true,
                    in_stack: true,
                    frame: None,
                    source: Source::ZeroFill,
                },
            );
        }
        self.materialize(va)
    }

    /// Handles a page fault at `fault_addr`, with `saved_sp` the
    /// interrupted stack pointer and `is_write` whether the fault was a
    /// write access. Returns whether the access should be allowed to
    /// proceed.
    pub fn page_fault(&self, fault_addr: Va, saved_sp: Va, is_write: bool) -> bool {
        if fault_addr.as_usize() == 0 || !fault_addr.is_user() {
            return false;
        }
        let page_va = fault_addr.round_down();

        let existing = {
            let pages = self.pages.lock();
            pages.get(&page_va).map(|p| (p.writable, p.in_stack, p.frame))
        };

        match existing {
            Some((writable, in_stack, frame)) => {
                if is_write && !writable {
                    return false;
                }
                if in_stack && !in_stack_window(fault_addr, saved_sp) {
                    return false;
                }
                if frame.is_some() {
                    return true;
                }
            }
            None => {
                if !in_stack_window(fault_addr, saved_sp) {
                    return false;
                }
                self.pages.lock().entry(page_va).or_insert(Page {
                    writable: true,
                    in_stack: true,
                    frame: None,
                    source: Source::ZeroFill,
                });
            }
        }

        match self.materialize(page_va) {
            Ok(()) => true,
            Err(_) => {
                self.pages.lock().remove(&page_va);
                false
            }
        }
    }

    fn build_on_evict(&self) -> Arc<dyn Fn(Va) -> KernelResult<()> + Send + Sync> {
        let pages = self.pages.clone();
        let swap = self.swap.clone();
        let pagedir = self.pagedir.clone();
        let allocator = self.allocator.clone();
        Arc::new(move |va: Va| -> KernelResult<()> {
            let pa = {
                let mut guard = pages.lock();
                let page = guard.get_mut(&va).ok_or(KernelError::NotFound)?;
                page.frame.take().ok_or(KernelError::NotFound)?
            };
            let data = allocator.read_page(pa);
            let mut guard = pages.lock();
            let page = guard.get_mut(&va).expect("page still present during eviction");
            match &page.source {
                Source::FileBacked { file, offset, bytes } => {
                    if pagedir.is_dirty(va) {
                        file.write_at(&data[..*bytes], *offset as usize)?;
                        pagedir.set_dirty(va, false);
                    }
                }
                Source::Swapped { .. } => {
                    unreachable!("a resident page's source is never already Swapped")
                }
                Source::ZeroFill => {
                    let slot = swap.write_out(&data)?;
                    page.source = Source::Swapped { slot };
                }
            }
            Ok(())
        })
    }

    fn materialize(&self, va: Va) -> KernelResult<()> {
        let (writable, source) = {
            let pages = self.pages.lock();
            let page = pages.get(&va).expect("page must exist before materialize");
            (page.writable, clone_source(&page.source))
        };

        let mut data = [0u8; PGSIZE];
        let settled_source = match source {
            Source::ZeroFill => Source::ZeroFill,
            Source::FileBacked { file, offset, bytes } => {
                let read = file.read_at(&mut data[..bytes], offset as usize)?;
                for b in data[read..bytes].iter_mut() {
                    *b = 0;
                }
                Source::FileBacked { file, offset, bytes }
            }
            Source::Swapped { slot } => {
                self.swap.read_in(slot, &mut data)?;
                Source::ZeroFill
            }
        };

        let on_evict = self.build_on_evict();
        let pa = self.frames.alloc(self.owner, va, self.pagedir.clone(), on_evict)?;
        self.allocator.write_page(pa, &data);

        {
            let mut pages = self.pages.lock();
            if let Some(page) = pages.get_mut(&va) {
                page.source = settled_source;
                page.frame = Some(pa);
            }
        }

        if !self.pagedir.set_page(va, pa, writable) {
            self.frames.free(pa);
            if let Some(page) = self.pages.lock().get_mut(&va) {
                page.frame = None;
            }
            return Err(KernelError::Permission);
        }
        self.frames.touch(pa);
        Ok(())
    }

    /// Tears down the page at `va`: writes back a dirty file-backed page,
    /// frees a held swap slot, releases a resident frame. Safe to call on
    /// an address with no page (a no-op).
    pub fn free_page(&self, va: Va) -> KernelResult<()> {
        let va = va.round_down();
        let page = self.pages.lock().remove(&va);
        let Some(page) = page else {
            return Ok(());
        };
        if let Some(pa) = page.frame {
            if let Source::FileBacked { file, offset, bytes } = &page.source {
                if self.pagedir.is_dirty(va) {
                    let data = self.allocator.read_page(pa);
                    file.write_at(&data[..*bytes], *offset as usize)?;
                }
            }
            self.frames.free(pa);
        } else if let Source::Swapped { slot } = page.source {
            self.swap.free(slot);
        }
        Ok(())
    }

    /// Maps `file`'s contents starting at `base`, one page per `PGSIZE`
    /// chunk. Fails if `base` is unaligned or null, the file is empty, or
    /// any page in the target range is already mapped; on a per-page
    /// failure partway through, every page created so far is rolled back.
    pub fn mmap(&self, file: &File<D, Fm>, base: Va) -> KernelResult<u32> {
        if base.as_usize() == 0 || !base.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let length = file.length() as usize;
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = (length + PGSIZE - 1) / PGSIZE;

        {
            let pages = self.pages.lock();
            for i in 0..page_count {
                if pages.contains_key(&(base + i * PGSIZE)) {
                    return Err(KernelError::InvalidArgument);
                }
            }
        }

        let reopened = Arc::new(file.reopen());
        let mut created = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let va = base + i * PGSIZE;
            let offset = i * PGSIZE;
            let bytes = if i + 1 == page_count {
                let rem = length % PGSIZE;
                if rem == 0 {
                    PGSIZE
                } else {
                    rem
                }
            } else {
                PGSIZE
            };
            self.pages.lock().insert(
                va,
                Page {
                    writable: true,
                    in_stack: false,
                    frame: None,
                    source: Source::FileBacked {
                        file: reopened.clone(),
                        offset: offset as u64,
                        bytes,
                    },
                },
            );
            created.push(va);
        }

        let id = self.next_mmap_id.fetch_add(1, Ordering::SeqCst);
        self.mmaps.lock().insert(
            id,
            MmapRegion {
                base,
                file: reopened,
                page_count,
            },
        );
        Ok(id)
    }

    /// Unmaps a region created by [`Self::mmap`], writing back any dirty
    /// pages through the file system.
    pub fn munmap(&self, id: u32) -> KernelResult<()> {
        let region = self.mmaps.lock().remove(&id).ok_or(KernelError::NotFound)?;
        for i in 0..region.page_count {
            self.free_page(region.base + i * PGSIZE)?;
        }
        region.file.close_ref();
        Ok(())
    }

    /// Tears down every page this table still holds — the process-exit
    /// path. Swap slots are freed, dirty file-backed pages are written
    /// back, every frame this process owns is released, and any mmap
    /// regions still outstanding have their duplicated file handles closed.
    pub fn destroy(&self) -> KernelResult<()> {
        let vas: Vec<Va> = self.pages.lock().keys().copied().collect();
        for va in vas {
            self.free_page(va)?;
        }
        let regions: Vec<MmapRegion<D, Fm>> = self.mmaps.lock().drain().map(|(_, region)| region).collect();
        for region in regions {
            region.file.close_ref();
        }
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}
