//! I/O manager objects consumed by the cache
//!
//! One `FileObject` exists per open handle to a file. All handles to the
//! same stream share one set of section object pointers, which is where
//! the cache parks the per-file shared cache map. The cache never touches
//! the storage stack through these objects; actual writes go through the
//! owner's `CacheCallbacks`.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// File object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// Temporary file: the lazy writer does not write it back.
        const TEMPORARY = 0x0000_0001;
    }
}

/// File sizes captured when caching is initialized.
#[derive(Debug, Clone, Copy)]
pub struct FileSizes {
    /// On-disk allocation, a multiple of the cluster size.
    pub allocation_size: u64,
    /// Logical end of file.
    pub file_size: u64,
    /// High watermark of written data.
    pub valid_data_length: u64,
}

impl FileSizes {
    pub fn with_size(file_size: u64) -> Self {
        Self {
            allocation_size: file_size,
            file_size,
            valid_data_length: file_size,
        }
    }
}

/// Section object pointers, shared by every handle to the same stream.
pub struct SectionObjectPointers {
    shared_cache_map: Mutex<Option<u32>>,
}

impl SectionObjectPointers {
    pub(crate) fn shared_cache_map(&self) -> Option<u32> {
        *self.shared_cache_map.lock()
    }

    pub(crate) fn set_shared_cache_map(&self, map: Option<u32>) {
        *self.shared_cache_map.lock() = map;
    }
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// An open file handle.
pub struct FileObject {
    id: u64,
    name: String,
    flags: FileFlags,
    section: SectionObjectPointers,
    has_private_cache_map: AtomicBool,
}

impl FileObject {
    pub fn new(name: &str, flags: FileFlags) -> Arc<FileObject> {
        Arc::new(FileObject {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            flags,
            section: SectionObjectPointers {
                shared_cache_map: Mutex::new(None),
            },
            has_private_cache_map: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    pub fn section(&self) -> &SectionObjectPointers {
        &self.section
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn has_private_cache_map(&self) -> bool {
        self.has_private_cache_map.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_private_cache_map(&self, has: bool) {
        self.has_private_cache_map.store(has, Ordering::Release);
    }
}
