//! # Virtual memory and the on-disk file system.
//!
//! This crate is the hardest engineering in a small educational kernel: the
//! buffer cache, the inode layer, the swap store, the frame table, and the
//! supplemental page table with its page-fault handler. These five pieces
//! are deeply intertwined — the buffer cache backs every sector the inode
//! layer touches, and the page-fault handler reaches into the inode layer
//! for file-backed pages and into the frame table and swap store for
//! everything else — so they live in one crate, organized leaf-to-root:
//!
//! 1. [`cache`] — an in-memory mirror of disk sectors, with write-behind and
//!    read-ahead.
//! 2. [`inode`] — indexed allocation on top of the cache: direct blocks plus
//!    one doubly-indirect tree, file growth, and deletion.
//! 3. [`fs`] — the file-system-level operations (`create`, `open`, `remove`)
//!    and the per-open-file handle, built on the inode layer.
//! 4. [`swap`] — bitmap-allocated, page-sized slots on a dedicated block
//!    device.
//! 5. [`frame`] — the physical-frame tracker and its second-chance eviction
//!    policy, which drives the swap store.
//! 6. [`vm`] — the per-process supplemental page table, the page-fault
//!    handler, and `mmap`/`munmap`.
//!
//! Everything this crate is handed from outside — a block device, a page
//! directory, a raw page allocator, a free-map, a place to run background
//! workers — is a trait from [`keos_support`], the collaborator crate. This
//! crate never reaches past those traits into anything resembling real
//! hardware, which is what makes it possible to exercise frame eviction,
//! swap round-trips, and concurrent inode access with plain `cargo test`.
//!
//! ## Non-goals
//!
//! This crate does not implement journaling or crash-consistent recovery,
//! variable-sized blocks, compression, encryption, or sub-sector coherence
//! across replicas. A write-behind tick that never fires before a crash
//! loses its dirty data, exactly as in the source design.

pub mod cache;
pub mod fs;
pub mod frame;
pub mod inode;
pub mod swap;
pub mod vm;

pub use keos_support::{KernelError, KernelResult};
