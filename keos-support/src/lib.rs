//! Collaborator substrate for the virtual-memory and file-system core.
//!
//! A kernel core does not live alone: it is handed a block device to read
//! sectors from, a page directory to install mappings into, a raw physical
//! page allocator, a free-map to carve sectors out of, and a scheduler to
//! run background workers on. This crate collects those seams as traits and
//! provides one reference implementation of each, so that the subsystems in
//! `storage-core` can be driven by real concurrent `std::thread`s in tests
//! without ever touching bare-metal hardware.
//!
//! None of the types here carry buffer-cache, inode, frame-table, or
//! paging logic — that lives in `storage-core`. This crate only answers
//! "what does the core need from the rest of the kernel", the same
//! question a base kernel crate answers for the subsystem crates built on
//! top of it.

pub mod addressing;
pub mod block;
pub mod freemap;
pub mod pagedir;
pub mod palloc;
pub mod sync;
pub mod thread;

use core::fmt;

/// The single error type surfaced across the collaborator and core layers.
///
/// Kept as one hand-rolled enum rather than a `thiserror`-derived type or a
/// boxed `dyn Error`: this is a leaf systems crate with a small, closed set
/// of failure modes, and every caller needs to match on *which* one
/// occurred (see `SHORT_IO` vs `PERMISSION` vs `OUT_OF_DISK` in the design
/// notes) rather than just display it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The free-map has no sectors left to hand out.
    OutOfDisk,
    /// The raw page allocator has no physical pages left.
    OutOfMemory,
    /// The swap bitmap has no free slots. Fatal by design (see spec §7).
    OutOfSwap,
    /// A sector, inode, file, or directory entry does not exist.
    NotFound,
    /// A write was attempted against a deny-written inode, or an access
    /// violated a supplemental page's permissions or stack window.
    Permission,
    /// A sector index or doubly-indirect tree position is out of range for
    /// the on-disk format (e.g. a file has grown past the addressable max).
    InvalidArgument,
    /// The on-disk inode's magic number did not match; the image is
    /// corrupted or was never formatted.
    CorruptImage,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfDisk => "free-map exhausted",
            KernelError::OutOfMemory => "no physical pages available",
            KernelError::OutOfSwap => "swap device exhausted",
            KernelError::NotFound => "no such sector, inode, or file",
            KernelError::Permission => "operation not permitted",
            KernelError::InvalidArgument => "argument out of range for this format",
            KernelError::CorruptImage => "on-disk image failed its magic check",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for KernelError {}

/// Result alias used throughout the collaborator and core crates.
pub type KernelResult<T> = Result<T, KernelError>;

/// Emits a diagnostic line tagged with the calling subsystem, mirroring the
/// source project's `info!`/`println!` console macros. Kept as a thin
/// wrapper over `eprintln!` rather than pulling in `log`/`tracing`: the
/// collaborator layer has exactly one sink (the test harness's stderr) and
/// no subscriber configuration to speak of.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        eprintln!("[info] {}", format!($($arg)*))
    };
}

/// Like [`info!`], tagged for conditions worth flagging but not fatal.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        eprintln!("[warn] {}", format!($($arg)*))
    };
}
