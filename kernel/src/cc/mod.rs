//! Cache Manager (cc)
//!
//! The cache manager maps regions of files into kernel-visible memory so
//! filesystem read/write paths can work on bytes instead of disk blocks:
//!
//! - **File caching**: every cached file gets a shared cache map; its
//!   data is reachable through fixed-size mapping windows (VACBs)
//! - **Lazy writer**: dirty windows age on a global FIFO and are written
//!   back in the background
//! - **Trimming**: memory pressure evicts the least-recently-used
//!   windows that nobody is using
//!
//! # Key structures
//!
//! - `ViewCache`: global registry (LRU list, dirty list, clean map list)
//! - `SharedCacheMap`: per-file cache state and VACB list
//! - `PrivateCacheMap`: per-handle read-ahead state
//! - `Vacb`: one mapped window of a file, the unit of caching
//!
//! # Usage
//!
//! The general procedure for a filesystem read or write dispatch routine:
//!
//! 1. If caching for the file has not been initiated, do so with
//!    `initialize_file_cache`.
//! 2. For each region being read or written obtain a view with
//!    `request_region`.
//! 3. If the view is being read, or not completely overwritten, and it is
//!    not up to date, read its data from the underlying medium first.
//! 4. Copy the data into or out of the view.
//! 5. Release the view with `release_region`.
//!
//! Durability comes from the owner's `CacheCallbacks::write_region`; the
//! cache itself has no on-disk layout.

pub mod lazywrite;
mod vacb;
mod view;

pub use lazywrite::{DeferredWrite, LazyWriterHook};
pub use vacb::VacbId;
pub use view::{CacheCallbacks, CacheMapId, CacheView, ViewCache, WriteRegion};

use crate::mm::PAGE_SIZE;

/// Size of a VACB mapping window (256 KB, the standard cache granularity).
pub const VACB_MAPPING_GRANULARITY: usize = 256 * 1024;

/// Pages covered by one VACB window.
pub const VACB_PAGES: u32 = (VACB_MAPPING_GRANULARITY / PAGE_SIZE) as u32;

/// Upper bound on concurrently cached files.
pub const MAX_CACHED_FILES: usize = 64;

/// Cache manager statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub shared_cache_maps: u32,
    pub vacbs: u32,
    pub dirty_pages: u32,
    pub dirty_page_threshold: u32,
}

/// Round a file offset down to its VACB window base.
#[inline]
pub(crate) fn window_base(file_offset: u64) -> u64 {
    file_offset & !(VACB_MAPPING_GRANULARITY as u64 - 1)
}
