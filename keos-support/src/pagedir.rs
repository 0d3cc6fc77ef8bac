//! The MMU collaborator: installing and querying page-table mappings.
//!
//! The fault handler never walks page tables itself; it asks a
//! [`PageDirectory`] to install, clear, or query a mapping. In the source
//! project this is `userprog/pagedir.c` wrapping the x86 page directory; in
//! this crate it is [`TestPageDirectory`], a map keyed by user virtual
//! address that is good enough to drive every invariant the frame table and
//! fault handler rely on (one mapping per address, a software dirty bit, a
//! writable bit) without ever touching real hardware page tables.

use crate::addressing::{Pa, Va};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    kpage: Pa,
    writable: bool,
    dirty: bool,
}

/// Abstraction over a process's hardware page table.
///
/// Implementors must be `Send + Sync`: the frame table holds this behind a
/// shared reference while the frame lock is held, but the directory itself
/// may be consulted by multiple threads belonging to the same process.
pub trait PageDirectory: Send + Sync {
    /// Returns the physical page mapped at `uva`, if any.
    fn get_page(&self, uva: Va) -> Option<Pa>;

    /// Installs a mapping from `uva` to `kpage`, with the given writable
    /// bit. Returns `false` if a mapping already exists at `uva`.
    fn set_page(&self, uva: Va, kpage: Pa, writable: bool) -> bool;

    /// Removes any mapping at `uva`.
    fn clear_page(&self, uva: Va);

    /// Whether the page at `uva` has been written to since the mapping was
    /// installed (or since the dirty bit was last cleared).
    fn is_dirty(&self, uva: Va) -> bool;

    /// Sets or clears the software dirty bit for `uva`.
    fn set_dirty(&self, uva: Va, dirty: bool);

    /// Marks `uva` as accessed/written for test purposes, simulating what
    /// real hardware would do on a load or store through the mapping.
    fn touch(&self, uva: Va, write: bool);
}

/// An in-memory [`PageDirectory`] keyed by virtual address.
#[derive(Default)]
pub struct TestPageDirectory {
    map: Mutex<HashMap<Va, Mapping>>,
}

impl TestPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageDirectory for TestPageDirectory {
    fn get_page(&self, uva: Va) -> Option<Pa> {
        self.map.lock().unwrap().get(&uva).map(|m| m.kpage)
    }

    fn set_page(&self, uva: Va, kpage: Pa, writable: bool) -> bool {
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&uva) {
            return false;
        }
        map.insert(
            uva,
            Mapping {
                kpage,
                writable,
                dirty: false,
            },
        );
        true
    }

    fn clear_page(&self, uva: Va) {
        self.map.lock().unwrap().remove(&uva);
    }

    fn is_dirty(&self, uva: Va) -> bool {
        self.map.lock().unwrap().get(&uva).map(|m| m.dirty).unwrap_or(false)
    }

    fn set_dirty(&self, uva: Va, dirty: bool) {
        if let Some(m) = self.map.lock().unwrap().get_mut(&uva) {
            m.dirty = dirty;
        }
    }

    fn touch(&self, uva: Va, write: bool) {
        if let Some(m) = self.map.lock().unwrap().get_mut(&uva) {
            if write {
                m.dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palloc::PageAllocator;

    #[test]
    fn set_then_clear_roundtrip() {
        let pd = TestPageDirectory::new();
        let pa = Pa(0x1000);
        let va = Va::new(0x8000);
        assert!(pd.set_page(va, pa, true));
        assert!(!pd.set_page(va, pa, true), "double-map must fail");
        assert_eq!(pd.get_page(va), Some(pa));
        pd.clear_page(va);
        assert_eq!(pd.get_page(va), None);
    }

    #[test]
    fn dirty_bit_tracks_writes() {
        let pd = TestPageDirectory::new();
        let va = Va::new(0x8000);
        pd.set_page(va, Pa(0x1000), true);
        assert!(!pd.is_dirty(va));
        pd.touch(va, true);
        assert!(pd.is_dirty(va));
        pd.set_dirty(va, false);
        assert!(!pd.is_dirty(va));
    }

    #[allow(dead_code)]
    fn _assert_object_safe(_: &dyn PageDirectory, _: &dyn PageAllocator) {}
}
