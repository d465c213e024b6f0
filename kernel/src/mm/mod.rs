//! Memory manager interface
//!
//! The cache manager does not own physical memory. It consumes three
//! primitives: create a kernel mapping of fixed length, release it, and
//! page individual frames of it out. `ViewProvider` is that seam;
//! `PoolViewProvider` backs it with zeroed pool allocations for hosts
//! (and tests) that have no real frame database.

use core::alloc::Layout;

use crate::status::NtStatus;

/// Size of a page frame.
pub const PAGE_SIZE: usize = 4096;

/// Provider of kernel virtual mappings for cache views.
pub trait ViewProvider: Send + Sync {
    /// Create a zero-filled mapping of `length` bytes and return its base
    /// address. `length` is always the cache mapping granularity.
    fn create_mapped_region(&self, length: usize) -> Result<*mut u8, NtStatus>;

    /// Release a mapping previously returned by `create_mapped_region`.
    fn release_region(&self, base: *mut u8, length: usize);

    /// Evict one page frame of a mapping. The contents must remain
    /// addressable; this is a hint that the frame may be repurposed.
    fn page_out(&self, base: *mut u8, length: usize);
}

/// Pool-backed view provider.
///
/// Mappings are page-aligned zeroed pool blocks. Page-out is a no-op:
/// with no frame database there is nothing to steal.
pub struct PoolViewProvider;

impl PoolViewProvider {
    fn layout(length: usize) -> Layout {
        match Layout::from_size_align(length, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => crate::bugcheck!(
                crate::ke::bugcheck::codes::CACHE_MANAGER,
                "bad view length {:#x}",
                length
            ),
        }
    }
}

impl ViewProvider for PoolViewProvider {
    fn create_mapped_region(&self, length: usize) -> Result<*mut u8, NtStatus> {
        let base = unsafe { alloc::alloc::alloc_zeroed(Self::layout(length)) };
        if base.is_null() {
            log::error!("unable to allocate {} byte view", length);
            return Err(NtStatus::InsufficientResources);
        }
        Ok(base)
    }

    fn release_region(&self, base: *mut u8, length: usize) {
        unsafe { alloc::alloc::dealloc(base, Self::layout(length)) };
    }

    fn page_out(&self, base: *mut u8, length: usize) {
        log::trace!("page out {:p} + {:#x}", base, length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_views_are_zeroed() {
        let provider = PoolViewProvider;
        let base = provider.create_mapped_region(4 * PAGE_SIZE).unwrap();
        let view = unsafe { core::slice::from_raw_parts(base, 4 * PAGE_SIZE) };
        assert!(view.iter().all(|&b| b == 0));
        provider.release_region(base, 4 * PAGE_SIZE);
    }
}
