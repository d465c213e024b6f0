//! View cache core
//!
//! One `ViewCache` owns the global registry: the VACB arena, the LRU
//! list, the dirty FIFO and the clean shared-cache-map list, all guarded
//! by the structural view lock. Each shared cache map additionally
//! carries its own fine lock for its window and private-map lists.
//!
//! Lock order is view lock, then map lock; the view lock is never held
//! across backing-store I/O or page-out. Reference-count zero
//! transitions destroy the VACB, and destruction always happens outside
//! the view lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::bugcheck;
use crate::io::{FileFlags, FileObject, FileSizes, SectionObjectPointers};
use crate::ke::bugcheck::codes::CACHE_MANAGER;
use crate::mm::{ViewProvider, PAGE_SIZE};
use crate::status::NtStatus;

use super::lazywrite::LazyWriteControl;
use super::vacb::{LinkSet, Vacb, VacbId, VacbList};
use super::{window_base, CacheStats, MAX_CACHED_FILES, VACB_MAPPING_GRANULARITY, VACB_PAGES};

/// Arena index of a shared cache map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMapId(pub(crate) u32);

/// A borrowed view of one file window.
pub struct CacheView {
    /// Kernel address of the window.
    pub base_address: *mut u8,
    /// Whether the window contents reflect the backing store.
    pub up_to_date: bool,
    /// The reference handed to the caller; give it back through
    /// `release_region`.
    pub vacb: VacbId,
}

/// One region handed to `CacheCallbacks::write_region`.
pub struct WriteRegion<'a> {
    pub file: &'a FileObject,
    pub file_offset: u64,
    pub data: &'a [u8],
}

/// Backing-store callbacks supplied by whoever owns the file.
///
/// The implementation carries its own context; `acquire_for_lazy_write`
/// and `release_from_lazy_write` bracket every background flush of the
/// file's windows.
pub trait CacheCallbacks: Send + Sync {
    fn acquire_for_lazy_write(&self, wait: bool) -> bool;
    fn release_from_lazy_write(&self);
    fn write_region(&self, region: &WriteRegion<'_>) -> NtStatus;
}

/// Per-handle cache state, used for sequential read detection.
pub(crate) struct PrivateCacheMap {
    file_id: u64,
    read_ahead_offset: u64,
    read_ahead_length: u32,
    sequential_reads: u32,
}

impl PrivateCacheMap {
    fn new(file_id: u64) -> Self {
        Self {
            file_id,
            read_ahead_offset: 0,
            read_ahead_length: VACB_MAPPING_GRANULARITY as u32,
            sequential_reads: 0,
        }
    }

    /// Track one read and return a read-ahead recommendation once the
    /// access pattern looks sequential.
    fn note_read(&mut self, offset: u64, length: u32) -> Option<(u64, u32)> {
        if offset == self.read_ahead_offset {
            self.sequential_reads += 1;
            if self.sequential_reads > 2
                && self.read_ahead_length < VACB_MAPPING_GRANULARITY as u32 * 4
            {
                self.read_ahead_length *= 2;
            }
        } else {
            self.sequential_reads = 0;
            self.read_ahead_length = VACB_MAPPING_GRANULARITY as u32;
        }
        self.read_ahead_offset = offset + length as u64;
        (self.sequential_reads > 1).then_some((self.read_ahead_offset, self.read_ahead_length))
    }
}

/// Per-file cache state, shared by every handle to the file.
pub(crate) struct SharedCacheMap {
    file: Arc<FileObject>,
    callbacks: Arc<dyn CacheCallbacks>,
    section_size: u64,
    file_size: u64,
    #[allow(dead_code)]
    valid_data_length: u64,
    #[allow(dead_code)]
    pin_access: bool,
    open_count: u32,
    dirty_pages: u32,
    trace: bool,
    vacb_list: VacbList,
    embedded_private: Option<PrivateCacheMap>,
    extra_private: Vec<PrivateCacheMap>,
    /// Fine lock for the window and private lists, nested inside the
    /// view lock.
    lock: Mutex<()>,
}

/// Everything the structural view lock protects.
struct ViewState {
    vacbs: Vec<Option<Vacb>>,
    vacb_free: Vec<u32>,
    maps: Vec<Option<SharedCacheMap>>,
    map_free: Vec<u32>,
    dirty_list: VacbList,
    lru_list: VacbList,
    clean_maps: Vec<u32>,
}

impl ViewState {
    fn new() -> Self {
        Self {
            vacbs: Vec::new(),
            vacb_free: Vec::new(),
            maps: Vec::new(),
            map_free: Vec::new(),
            dirty_list: VacbList::new(LinkSet::Dirty),
            lru_list: VacbList::new(LinkSet::Lru),
            clean_maps: Vec::new(),
        }
    }

    fn vacb(&self, id: u32) -> &Vacb {
        match self.vacbs[id as usize].as_ref() {
            Some(vacb) => vacb,
            None => bugcheck!(CACHE_MANAGER, "reference to freed VACB {}", id),
        }
    }

    fn vacb_mut(&mut self, id: u32) -> &mut Vacb {
        match self.vacbs[id as usize].as_mut() {
            Some(vacb) => vacb,
            None => bugcheck!(CACHE_MANAGER, "reference to freed VACB {}", id),
        }
    }

    fn map_opt(&self, id: u32) -> Option<&SharedCacheMap> {
        self.maps.get(id as usize).and_then(|m| m.as_ref())
    }

    fn map_opt_mut(&mut self, id: u32) -> Option<&mut SharedCacheMap> {
        self.maps.get_mut(id as usize).and_then(|m| m.as_mut())
    }

    fn map_expect(&self, id: u32) -> &SharedCacheMap {
        match self.map_opt(id) {
            Some(map) => map,
            None => bugcheck!(CACHE_MANAGER, "reference to dead cache map {}", id),
        }
    }

    fn map_expect_mut(&mut self, id: u32) -> &mut SharedCacheMap {
        match self.maps.get_mut(id as usize).and_then(|m| m.as_mut()) {
            Some(map) => map,
            None => bugcheck!(CACHE_MANAGER, "reference to dead cache map {}", id),
        }
    }

    fn alloc_vacb_slot(&mut self, vacb: Vacb) -> u32 {
        if let Some(id) = self.vacb_free.pop() {
            self.vacbs[id as usize] = Some(vacb);
            id
        } else {
            self.vacbs.push(Some(vacb));
            (self.vacbs.len() - 1) as u32
        }
    }

    /// Detach a dead VACB from the arena. The slot must be clean,
    /// unmapped, unreferenced and off every list.
    fn take_vacb_slot(&mut self, id: u32) -> Vacb {
        let vacb = match self.vacbs[id as usize].take() {
            Some(vacb) => vacb,
            None => bugcheck!(CACHE_MANAGER, "double free of VACB {}", id),
        };
        if vacb.ref_count != 0
            || vacb.pin_count != 0
            || vacb.mapped_count != 0
            || vacb.dirty
            || vacb.is_linked(LinkSet::CacheMap)
            || vacb.is_linked(LinkSet::Dirty)
            || vacb.is_linked(LinkSet::Lru)
        {
            error!(
                "invalid VACB free: refs {}, pins {}, maps {}",
                vacb.ref_count, vacb.pin_count, vacb.mapped_count
            );
            bugcheck!(CACHE_MANAGER, "VACB {} freed with outstanding state", id);
        }
        self.vacb_free.push(id);
        vacb
    }

    fn alloc_map_slot(&mut self, map: SharedCacheMap) -> u32 {
        if let Some(id) = self.map_free.pop() {
            self.maps[id as usize] = Some(map);
            id
        } else {
            self.maps.push(Some(map));
            (self.maps.len() - 1) as u32
        }
    }

    fn release_map_slot(&mut self, id: u32) -> SharedCacheMap {
        let map = match self.maps[id as usize].take() {
            Some(map) => map,
            None => bugcheck!(CACHE_MANAGER, "double release of cache map {}", id),
        };
        self.map_free.push(id);
        map
    }

    fn live_map_count(&self) -> usize {
        self.maps.iter().flatten().count()
    }

    fn live_vacb_count(&self) -> usize {
        self.vacbs.iter().flatten().count()
    }

    fn inc_ref(&mut self, id: u32) -> u32 {
        let vacb = self.vacb_mut(id);
        vacb.ref_count += 1;
        let refs = vacb.ref_count;
        let (dirty, page_out, map) = (vacb.dirty, vacb.page_out, vacb.cache_map);
        if self.map_opt(map).is_some_and(|m| m.trace) {
            debug!("VACB {} ++RefCount={}, Dirty {}, PageOut {}", id, refs, dirty, page_out);
        }
        refs
    }

    /// Drop one reference. A zero transition queues the VACB on `reaped`
    /// for destruction once the view lock is released.
    fn dec_ref(&mut self, id: u32, reaped: &mut Vec<u32>) -> u32 {
        let vacb = self.vacb_mut(id);
        if vacb.ref_count == 0 {
            bugcheck!(CACHE_MANAGER, "over-release of VACB {}", id);
        }
        vacb.ref_count -= 1;
        let refs = vacb.ref_count;
        if refs == 0 && vacb.dirty {
            bugcheck!(CACHE_MANAGER, "dirty VACB {} dropped to zero references", id);
        }
        let (dirty, page_out, map) = (vacb.dirty, vacb.page_out, vacb.cache_map);
        if self.map_opt(map).is_some_and(|m| m.trace) {
            debug!("VACB {} --RefCount={}, Dirty {}, PageOut {}", id, refs, dirty, page_out);
        }
        if refs == 0 {
            reaped.push(id);
        }
        refs
    }

    /// Find the window covering `offset` and take a reference on it.
    fn lookup_vacb(&mut self, map_id: u32, offset: u64) -> Option<u32> {
        let found = {
            let map = self.map_opt(map_id)?;
            let _map_lock = map.lock.lock();
            let mut cur = map.vacb_list.head();
            let mut found = None;
            while let Some(id) = cur {
                let vacb = self.vacb(id);
                if vacb.covers(offset) {
                    found = Some(id);
                    break;
                }
                if vacb.file_offset > offset {
                    break;
                }
                cur = map.vacb_list.next(&self.vacbs, id);
            }
            found
        };
        if let Some(id) = found {
            self.inc_ref(id);
        }
        found
    }

    /// Insert a freshly created window into its map's sorted list.
    fn insert_vacb_sorted(&mut self, map_id: u32, id: u32) {
        let offset = self.vacb(id).file_offset;
        let before = {
            let map = self.map_expect(map_id);
            let mut cur = map.vacb_list.head();
            let mut before = None;
            while let Some(candidate) = cur {
                if self.vacb(candidate).file_offset > offset {
                    before = Some(candidate);
                    break;
                }
                cur = map.vacb_list.next(&self.vacbs, candidate);
            }
            before
        };
        let map = match self.maps[map_id as usize].as_mut() {
            Some(map) => map,
            None => bugcheck!(CACHE_MANAGER, "insert into dead cache map {}", map_id),
        };
        let _map_lock = map.lock.lock();
        match before {
            Some(before) => map.vacb_list.insert_before(&mut self.vacbs, before, id),
            None => map.vacb_list.push_tail(&mut self.vacbs, id),
        }
    }

    /// Move the window to the most-recently-used end of the LRU.
    fn lru_touch(&mut self, id: u32) {
        if self.vacb(id).is_linked(LinkSet::Lru) {
            self.lru_list.remove(&mut self.vacbs, id);
        }
        self.lru_list.push_tail(&mut self.vacbs, id);
    }

    /// Drop the window from the LRU if it is on it.
    fn lru_remove(&mut self, id: u32) {
        if self.vacb(id).is_linked(LinkSet::Lru) {
            self.lru_list.remove(&mut self.vacbs, id);
        }
    }

    /// Put the window on the dirty FIFO and charge its pages.
    fn mark_dirty_vacb(&mut self, id: u32) {
        if self.vacb(id).dirty {
            bugcheck!(CACHE_MANAGER, "VACB {} marked dirty twice", id);
        }
        self.inc_ref(id);
        self.dirty_list.push_tail(&mut self.vacbs, id);
        self.lru_touch(id);
        self.vacb_mut(id).dirty = true;
        let map_id = self.vacb(id).cache_map;
        match self.map_opt_mut(map_id) {
            Some(map) => map.dirty_pages += VACB_PAGES,
            None => warn!("dirty VACB {} belongs to a dead cache map", id),
        }
    }

    /// Take the window off the dirty FIFO and release its charge.
    fn unmark_dirty_vacb(&mut self, id: u32, reaped: &mut Vec<u32>) {
        if !self.vacb(id).dirty {
            bugcheck!(CACHE_MANAGER, "VACB {} unmarked while clean", id);
        }
        self.vacb_mut(id).dirty = false;
        self.dirty_list.remove(&mut self.vacbs, id);
        let map_id = self.vacb(id).cache_map;
        if let Some(map) = self.map_opt_mut(map_id) {
            map.dirty_pages -= VACB_PAGES;
        }
        self.dec_ref(id, reaped);
    }

    /// Move a failed window to the back of the dirty FIFO so restarting
    /// the walk from the head cannot revisit it forever.
    fn requeue_dirty_tail(&mut self, id: u32) {
        if self.vacb(id).dirty {
            self.dirty_list.remove(&mut self.vacbs, id);
            self.dirty_list.push_tail(&mut self.vacbs, id);
        }
    }

    /// Detach the tail window of a map's list during teardown.
    fn pop_map_vacb(&mut self, map_id: u32) -> Option<u32> {
        let Self { maps, vacbs, .. } = self;
        let map = maps.get_mut(map_id as usize)?.as_mut()?;
        let _map_lock = map.lock.lock();
        map.vacb_list.pop_tail(vacbs)
    }

    /// Unlink a window chosen for eviction from its map list and the LRU.
    fn unlink_for_eviction(&mut self, id: u32) {
        let map_id = self.vacb(id).cache_map;
        if let Some(map) = self.maps[map_id as usize].as_mut() {
            let _map_lock = map.lock.lock();
            map.vacb_list.remove(&mut self.vacbs, id);
        }
        self.lru_list.remove(&mut self.vacbs, id);
    }
}

/// The view cache.
pub struct ViewCache {
    provider: Arc<dyn ViewProvider>,
    state: Mutex<ViewState>,
    /// Eviction is serialized; concurrent trimmers would invalidate each
    /// other's reference-count reasoning across the page-out window.
    trim_lock: Mutex<()>,
    total_dirty_pages: AtomicU32,
    pub(crate) lazy: LazyWriteControl,
}

impl ViewCache {
    /// Create an empty cache on top of `provider`.
    pub fn new(provider: Arc<dyn ViewProvider>) -> ViewCache {
        ViewCache {
            provider,
            state: Mutex::new(ViewState::new()),
            trim_lock: Mutex::new(()),
            total_dirty_pages: AtomicU32::new(0),
            lazy: LazyWriteControl::new(),
        }
    }

    /// Total dirty pages across every cached file.
    pub fn total_dirty_pages(&self) -> u32 {
        self.total_dirty_pages.load(Ordering::Acquire)
    }

    /// Destroy reaped VACBs: release their mappings and return their
    /// arena slots. Never called with the view lock held.
    fn reap(&self, reaped: Vec<u32>) {
        for id in reaped {
            let vacb = {
                let mut state = self.state.lock();
                state.take_vacb_slot(id)
            };
            trace!("freeing VACB {} (offset {:#x})", id, vacb.file_offset);
            self.provider
                .release_region(vacb.base_address, VACB_MAPPING_GRANULARITY);
        }
    }

    // ------------------------------------------------------------------
    // File-level setup and teardown
    // ------------------------------------------------------------------

    /// Initialize caching for one handle to `file`. Creates the shared
    /// cache map on the first call and a private cache map per handle.
    pub fn initialize_file_cache(
        &self,
        file: &Arc<FileObject>,
        sizes: FileSizes,
        pin_access: bool,
        callbacks: Arc<dyn CacheCallbacks>,
    ) -> NtStatus {
        let mut state = self.state.lock();

        let mut allocated = false;
        let map_id = match file.section().shared_cache_map() {
            Some(id) => id,
            None => {
                allocated = true;
                let id = state.alloc_map_slot(SharedCacheMap {
                    file: Arc::clone(file),
                    callbacks: Arc::clone(&callbacks),
                    section_size: sizes.allocation_size.max(sizes.file_size),
                    file_size: sizes.file_size,
                    valid_data_length: sizes.valid_data_length,
                    pin_access,
                    open_count: 0,
                    dirty_pages: 0,
                    trace: false,
                    vacb_list: VacbList::new(LinkSet::CacheMap),
                    embedded_private: None,
                    extra_private: Vec::new(),
                    lock: Mutex::new(()),
                });
                state.clean_maps.push(id);
                file.section().set_shared_cache_map(Some(id));
                id
            }
        };

        if allocated && state.live_map_count() > MAX_CACHED_FILES {
            // Unwind the partial insertion before surfacing the failure.
            state.clean_maps.retain(|&m| m != map_id);
            file.section().set_shared_cache_map(None);
            state.release_map_slot(map_id);
            warn!("cached file limit reached, refusing {}", file.name());
            return NtStatus::InsufficientResources;
        }

        if !file.has_private_cache_map() {
            let map = state.map_expect_mut(map_id);
            let private = PrivateCacheMap::new(file.id());
            {
                let _map_lock = map.lock.lock();
                if map.embedded_private.is_none() {
                    map.embedded_private = Some(private);
                } else {
                    map.extra_private.push(private);
                }
            }
            map.open_count += 1;
            file.set_has_private_cache_map(true);
        }

        NtStatus::Success
    }

    /// Shared cache map currently installed for `file`, if any.
    pub fn cache_map_of(&self, file: &FileObject) -> Option<CacheMapId> {
        file.section().shared_cache_map().map(CacheMapId)
    }

    /// Take an extra open reference on an already-cached file.
    pub fn reference_file_cache(&self, file: &FileObject) {
        let mut state = self.state.lock();
        let Some(map_id) = file.section().shared_cache_map() else {
            bugcheck!(CACHE_MANAGER, "reference of uncached file {}", file.name());
        };
        let map = state.map_expect_mut(map_id);
        if map.open_count == 0 {
            bugcheck!(CACHE_MANAGER, "reference of torn-down cache map {}", map_id);
        }
        map.open_count += 1;
    }

    /// Called when a handle to the file is closed. Kills the handle's
    /// private cache map and tears the shared map down on the last
    /// close.
    pub fn release_file_cache(&self, file: &Arc<FileObject>) -> NtStatus {
        let mut last = false;
        {
            let mut state = self.state.lock();
            let Some(map_id) = file.section().shared_cache_map() else {
                return NtStatus::Success;
            };
            let Some(map) = state.map_opt_mut(map_id) else {
                return NtStatus::Success;
            };
            if file.has_private_cache_map() {
                let _map_lock = map.lock.lock();
                if map
                    .embedded_private
                    .as_ref()
                    .is_some_and(|p| p.file_id == file.id())
                {
                    map.embedded_private = None;
                } else {
                    map.extra_private.retain(|p| p.file_id != file.id());
                }
                file.set_has_private_cache_map(false);
            }
            if map.open_count > 0 {
                map.open_count -= 1;
                last = map.open_count == 0;
            }
        }
        if last {
            self.delete_file_cache(file)
        } else {
            NtStatus::Success
        }
    }

    /// Tear the file's shared cache map down: flush everything, release
    /// every window, detach the map from the section pointers.
    pub fn delete_file_cache(&self, file: &Arc<FileObject>) -> NtStatus {
        let Some(map_id) = file.section().shared_cache_map() else {
            return NtStatus::Unsuccessful;
        };
        {
            // Guard against re-entry while the flush runs unlocked.
            let mut state = self.state.lock();
            match state.map_opt_mut(map_id) {
                Some(map) => map.open_count += 1,
                None => return NtStatus::Unsuccessful,
            }
        }
        let _ = self.flush_cache(file.section(), None, 0);

        let mut reaped = Vec::new();
        let mut staged = Vec::new();
        let mut dirty_pages_dropped = 0u32;
        {
            let mut state = self.state.lock();
            let map = state.map_expect_mut(map_id);
            map.open_count -= 1;
            if map.open_count != 0 {
                return NtStatus::Success;
            }
            file.section().set_shared_cache_map(None);

            loop {
                let Some(id) = state.pop_map_vacb(map_id) else { break };
                state.lru_remove(id);
                if state.vacb(id).dirty {
                    warn!("freeing dirty VACB {} at teardown", id);
                    state.unmark_dirty_vacb(id, &mut reaped);
                    dirty_pages_dropped += VACB_PAGES;
                }
                if state.vacb(id).mapped_count != 0 {
                    warn!("freeing mapped VACB {}", id);
                    state.vacb_mut(id).mapped_count = 0;
                    state.dec_ref(id, &mut reaped);
                }
                staged.push(id);
            }

            state.clean_maps.retain(|&m| m != map_id);
            let map = state.release_map_slot(map_id);
            drop(state);
            if dirty_pages_dropped != 0 {
                self.total_dirty_pages
                    .fetch_sub(dirty_pages_dropped, Ordering::AcqRel);
            }
            // dereference the file object
            drop(map);
        }

        for id in staged {
            let mut state = self.state.lock();
            let refs = state.dec_ref(id, &mut reaped);
            if refs != 0 {
                error!(
                    "VACB {} holds {} references at teardown; the last releaser will free it",
                    id, refs
                );
            }
        }
        self.reap(reaped);
        NtStatus::Success
    }

    /// File object behind a set of section pointers.
    pub fn get_file_object_from_section(
        &self,
        section: &SectionObjectPointers,
    ) -> Option<Arc<FileObject>> {
        let map_id = section.shared_cache_map()?;
        let state = self.state.lock();
        state.map_opt(map_id).map(|m| Arc::clone(&m.file))
    }

    // ------------------------------------------------------------------
    // Window access
    // ------------------------------------------------------------------

    /// Borrow the window covering `file_offset`, creating and mapping it
    /// if no window covers the offset yet. The offset must be aligned to
    /// the mapping granularity.
    pub fn request_region(
        &self,
        map: CacheMapId,
        file_offset: u64,
    ) -> Result<CacheView, NtStatus> {
        if file_offset % VACB_MAPPING_GRANULARITY as u64 != 0 {
            bugcheck!(
                CACHE_MANAGER,
                "bad file offset {:#x}, should be multiple of {:#x}",
                file_offset,
                VACB_MAPPING_GRANULARITY
            );
        }
        let id = self.get_vacb(map.0, file_offset)?;
        let mut state = self.state.lock();
        state.lru_touch(id);
        let vacb = state.vacb(id);
        debug_assert!(vacb.ref_count > 1);
        Ok(CacheView {
            base_address: vacb.base_address,
            up_to_date: vacb.valid,
            vacb: VacbId(id),
        })
    }

    /// Look the window up, or create it. Returns with one caller
    /// reference taken.
    fn get_vacb(&self, map_id: u32, file_offset: u64) -> Result<u32, NtStatus> {
        {
            let mut state = self.state.lock();
            if let Some(id) = state.lookup_vacb(map_id, file_offset) {
                return Ok(id);
            }
            let map = match state.map_opt(map_id) {
                Some(map) => map,
                None => return Err(NtStatus::InvalidParameter),
            };
            if file_offset >= map.section_size {
                return Err(NtStatus::InvalidParameter);
            }
        }

        // Map the window first; the provider may block, and no lock is
        // needed until the window is published.
        let base_address = self.provider.create_mapped_region(VACB_MAPPING_GRANULARITY)?;

        let mut state = self.state.lock();
        // There is a window between the lookup above and here; if another
        // creator won, release the newly created mapping and use theirs.
        if let Some(existing) = state.lookup_vacb(map_id, file_offset) {
            if state.map_opt(map_id).is_some_and(|m| m.trace) {
                debug!("deleting newly created mapping, found existing VACB {}", existing);
            }
            drop(state);
            self.provider
                .release_region(base_address, VACB_MAPPING_GRANULARITY);
            return Ok(existing);
        }

        let id = state.alloc_vacb_slot(Vacb::new(map_id, window_base(file_offset), base_address));
        state.inc_ref(id); // list membership
        state.insert_vacb_sorted(map_id, id);
        state.lru_touch(id);
        state.inc_ref(id); // caller reference
        Ok(id)
    }

    /// Return a borrowed window. Updates validity, optionally marks the
    /// window dirty, and optionally records a filesystem mapping pin.
    pub fn release_region(
        &self,
        map: CacheMapId,
        vacb: VacbId,
        valid: bool,
        dirty: bool,
        mapped: bool,
    ) -> NtStatus {
        let _ = map;
        let id = vacb.0;
        let mut reaped = Vec::new();
        let mut schedule = false;
        {
            let mut state = self.state.lock();
            state.vacb_mut(id).valid = valid;
            if dirty && !state.vacb(id).dirty {
                state.mark_dirty_vacb(id);
                self.total_dirty_pages.fetch_add(VACB_PAGES, Ordering::AcqRel);
                schedule = true;
            }
            if mapped {
                let vacb = state.vacb_mut(id);
                vacb.mapped_count += 1;
                if vacb.mapped_count == 1 {
                    state.inc_ref(id);
                }
            }
            state.dec_ref(id, &mut reaped);
        }
        self.reap(reaped);
        if schedule {
            self.kick_lazy_writer();
        }
        NtStatus::Success
    }

    /// Drop a filesystem mapping pin recorded by a prior mapped release.
    pub fn unmap_region(&self, map: CacheMapId, file_offset: u64, now_dirty: bool) -> NtStatus {
        let mut reaped = Vec::new();
        let mut schedule = false;
        {
            let mut state = self.state.lock();
            let Some(id) = state.lookup_vacb(map.0, file_offset) else {
                return NtStatus::Unsuccessful;
            };
            {
                let vacb = state.vacb_mut(id);
                if vacb.mapped_count == 0 {
                    bugcheck!(CACHE_MANAGER, "unmap of unmapped VACB {}", id);
                }
                vacb.mapped_count -= 1;
            }
            if state.vacb(id).mapped_count == 0 {
                state.dec_ref(id, &mut reaped);
            }
            if now_dirty && !state.vacb(id).dirty {
                state.mark_dirty_vacb(id);
                self.total_dirty_pages.fetch_add(VACB_PAGES, Ordering::AcqRel);
                schedule = true;
            }
            state.dec_ref(id, &mut reaped);
        }
        self.reap(reaped);
        if schedule {
            self.kick_lazy_writer();
        }
        NtStatus::Success
    }

    /// Mark the window covering `file_offset` dirty. The window must
    /// exist; a miss is a caller bug.
    pub fn mark_dirty(&self, map: CacheMapId, file_offset: u64) -> NtStatus {
        let mut reaped = Vec::new();
        let mut schedule = false;
        {
            let mut state = self.state.lock();
            let Some(id) = state.lookup_vacb(map.0, file_offset) else {
                bugcheck!(
                    CACHE_MANAGER,
                    "mark dirty: no VACB covers offset {:#x}",
                    file_offset
                );
            };
            if !state.vacb(id).dirty {
                state.mark_dirty_vacb(id);
                self.total_dirty_pages.fetch_add(VACB_PAGES, Ordering::AcqRel);
                schedule = true;
            }
            state.dec_ref(id, &mut reaped);
        }
        self.reap(reaped);
        if schedule {
            self.kick_lazy_writer();
        }
        NtStatus::Success
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Write one dirty window through the backing store and, on success,
    /// transition it clean. The caller holds a reference.
    fn flush_vacb(&self, id: u32) -> NtStatus {
        let (file, callbacks, base_address, file_offset, file_size) = {
            let state = self.state.lock();
            let vacb = state.vacb(id);
            let map = state.map_expect(vacb.cache_map);
            (
                Arc::clone(&map.file),
                Arc::clone(&map.callbacks),
                vacb.base_address,
                vacb.file_offset,
                map.file_size,
            )
        };

        let length = core::cmp::min(
            VACB_MAPPING_GRANULARITY as u64,
            file_size.saturating_sub(file_offset),
        ) as usize;
        let status = if length == 0 {
            NtStatus::Success
        } else {
            let data = unsafe { core::slice::from_raw_parts(base_address, length) };
            callbacks.write_region(&WriteRegion {
                file: &file,
                file_offset,
                data,
            })
        };

        if status.is_success() {
            let mut reaped = Vec::new();
            let mut state = self.state.lock();
            state.unmark_dirty_vacb(id, &mut reaped);
            drop(state);
            self.total_dirty_pages.fetch_sub(VACB_PAGES, Ordering::AcqRel);
            self.reap(reaped);
        }
        status
    }

    /// Flush the dirty windows covering `[file_offset, file_offset +
    /// length)` of the file behind `section`; the whole file when no
    /// offset is given. Returns the first failure.
    pub fn flush_cache(
        &self,
        section: &SectionObjectPointers,
        file_offset: Option<u64>,
        length: u64,
    ) -> NtStatus {
        let Some(map_id) = section.shared_cache_map() else {
            return NtStatus::InvalidParameter;
        };
        let (mut offset, mut remaining) = match file_offset {
            Some(offset) => (offset, length),
            None => {
                let state = self.state.lock();
                match state.map_opt(map_id) {
                    Some(map) => (0, map.file_size),
                    None => return NtStatus::InvalidParameter,
                }
            }
        };

        let mut first_failure = NtStatus::Success;
        let mut reaped = Vec::new();
        while remaining > 0 {
            let found = {
                let mut state = self.state.lock();
                state.lookup_vacb(map_id, offset)
            };
            if let Some(id) = found {
                let dirty = {
                    let state = self.state.lock();
                    state.vacb(id).dirty
                };
                if dirty {
                    let status = self.flush_vacb(id);
                    if !status.is_success() {
                        warn!("flush of VACB {} failed ({:?})", id, status);
                        if first_failure.is_success() {
                            first_failure = status;
                        }
                    }
                }
                let mut state = self.state.lock();
                state.dec_ref(id, &mut reaped);
            }
            offset += VACB_MAPPING_GRANULARITY as u64;
            remaining -= core::cmp::min(remaining, VACB_MAPPING_GRANULARITY as u64);
        }
        self.reap(reaped);
        first_failure
    }

    /// Walk the dirty FIFO writing windows back until `target_pages`
    /// pages have been credited. Returns the pages credited.
    ///
    /// A window is skipped while any other borrower holds it, when the
    /// owner refuses the lazy-write lock, and (on the lazy path) when
    /// the file is temporary. The structural lock is never held across
    /// the write; after each write the walk restarts from the head.
    pub fn flush_dirty(&self, target_pages: u32, called_from_lazy: bool) -> u32 {
        let wait = called_from_lazy;
        let mut target = target_pages;
        let mut count = 0u32;
        let mut reaped = Vec::new();

        let mut state = self.state.lock();
        if state.dirty_list.is_empty() {
            trace!("no dirty pages");
        }
        let mut cur = state.dirty_list.head();
        while target > 0 {
            let Some(id) = cur else { break };
            let next = state.dirty_list.next(&state.vacbs, id);
            state.inc_ref(id);

            let Some((file_flags, callbacks)) = ({
                let vacb = state.vacb(id);
                state
                    .map_opt(vacb.cache_map)
                    .map(|m| (m.file.flags(), Arc::clone(&m.callbacks)))
            }) else {
                state.dec_ref(id, &mut reaped);
                cur = next;
                continue;
            };

            // The lazy writer leaves temporary files alone.
            if called_from_lazy && file_flags.contains(FileFlags::TEMPORARY) {
                state.dec_ref(id, &mut reaped);
                cur = next;
                continue;
            }

            if !callbacks.acquire_for_lazy_write(wait) {
                state.dec_ref(id, &mut reaped);
                cur = next;
                continue;
            }

            debug_assert!(state.vacb(id).dirty);

            // One reference is ours, one belongs to the dirty list and
            // one to the map/LRU membership; anything above that is a
            // concurrent borrower and the window is too hot to write.
            if state.vacb(id).ref_count > 3 {
                callbacks.release_from_lazy_write();
                state.dec_ref(id, &mut reaped);
                cur = next;
                continue;
            }

            drop(state);
            let status = self.flush_vacb(id);
            callbacks.release_from_lazy_write();
            state = self.state.lock();
            state.dec_ref(id, &mut reaped);

            match status {
                status
                    if status.is_success()
                        || status == NtStatus::EndOfFile
                        || status == NtStatus::MediaWriteProtected =>
                {
                    count += VACB_PAGES;
                    target = target.saturating_sub(VACB_PAGES);
                    // End-of-file and write-protected windows stay dirty
                    // but still count as handled; keep them off the
                    // walk's way.
                    state.requeue_dirty_tail(id);
                }
                status => {
                    warn!("CC: failed to flush VACB {} ({:?})", id, status);
                    state.requeue_dirty_tail(id);
                }
            }

            // The list may have been rearranged while unlocked.
            cur = state.dirty_list.head();
        }
        drop(state);
        self.reap(reaped);
        count
    }

    /// Free memory from the cache under pressure. Pages out mapped clean
    /// windows and evicts every window nobody is using, flushing dirty
    /// data once if the target is not met. Returns pages credited toward
    /// `target_pages`.
    pub fn trim_cache(&self, target_pages: u32, priority: u32) -> u32 {
        let _trimming = self.trim_lock.lock();
        let _ = priority;
        let mut target = target_pages;
        let mut freed = 0u32;
        let mut flushed_pages = false;
        let mut staged: Vec<u32> = Vec::new();
        let mut reaped: Vec<u32> = Vec::new();

        loop {
            let mut state = self.state.lock();
            let mut cur = state.lru_list.head();
            while let Some(id) = cur {
                let mut next = state.lru_list.next(&state.vacbs, id);
                state.inc_ref(id);

                let (mapped_clean, base_address) = {
                    let vacb = state.vacb(id);
                    (vacb.mapped_count > 0 && !vacb.dirty, vacb.base_address)
                };
                if mapped_clean {
                    // Both locks go away while the frames are stolen.
                    state.vacb_mut(id).page_out = true;
                    drop(state);
                    for page in 0..VACB_PAGES as usize {
                        self.provider
                            .page_out(unsafe { base_address.add(page * PAGE_SIZE) }, PAGE_SIZE);
                    }
                    state = self.state.lock();
                    state.vacb_mut(id).page_out = false;
                    // Our walk position may be stale; recompute it.
                    next = if state.vacb(id).is_linked(LinkSet::Lru) {
                        state.lru_list.next(&state.vacbs, id)
                    } else {
                        state.lru_list.head()
                    };
                }

                let refs = state.dec_ref(id, &mut reaped);
                if refs == 1 && state.vacb(id).is_linked(LinkSet::Lru) {
                    // Only the map/LRU membership reference remains.
                    let vacb = state.vacb(id);
                    if vacb.dirty || vacb.mapped_count != 0 {
                        bugcheck!(CACHE_MANAGER, "idle VACB {} with residual state", id);
                    }
                    state.unlink_for_eviction(id);
                    staged.push(id);
                    let pages = core::cmp::min(VACB_PAGES, target);
                    target -= pages;
                    freed += pages;
                }
                cur = next;
            }
            drop(state);

            if target > 0 && !flushed_pages {
                // Flush dirty pages to disk and take one more pass.
                flushed_pages = true;
                let pages = self.flush_dirty(target, false);
                if pages != 0 {
                    debug!("flushed {} dirty cache pages to disk", pages);
                    if pages < target {
                        target = pages;
                    }
                    continue;
                }
            }
            break;
        }

        // Drop the staged windows' last reference outside all locks.
        for id in staged {
            let mut state = self.state.lock();
            let refs = state.dec_ref(id, &mut reaped);
            debug_assert_eq!(refs, 0);
        }
        self.reap(reaped);
        debug!("evicted {} cache pages", freed);
        freed
    }

    // ------------------------------------------------------------------
    // Read-ahead bookkeeping
    // ------------------------------------------------------------------

    /// Record a read on this handle's private cache map. Returns a
    /// recommended read-ahead window once the access pattern is
    /// sequential.
    pub fn note_read(&self, file: &FileObject, offset: u64, length: u32) -> Option<(u64, u32)> {
        let map_id = file.section().shared_cache_map()?;
        let mut state = self.state.lock();
        let map = state.map_opt_mut(map_id)?;
        let _map_lock = map.lock.lock();
        let private = if map
            .embedded_private
            .as_ref()
            .is_some_and(|p| p.file_id == file.id())
        {
            map.embedded_private.as_mut()
        } else {
            map.extra_private.iter_mut().find(|p| p.file_id == file.id())
        }?;
        private.note_read(offset, length)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Enable or disable reference tracing for one cached file.
    pub fn set_trace(&self, map: CacheMapId, enable: bool) {
        let mut state = self.state.lock();
        let Some(shared) = state.map_opt_mut(map.0) else {
            return;
        };
        shared.trace = enable;
        if !enable {
            return;
        }
        debug!("enabling tracing for cache map {}", map.0);
        let shared = state.map_expect(map.0);
        let mut cur = shared.vacb_list.head();
        while let Some(id) = cur {
            let vacb = state.vacb(id);
            debug!(
                "  VACB {} enabled, RefCount {}, Dirty {}, PageOut {}",
                id, vacb.ref_count, vacb.dirty, vacb.page_out
            );
            cur = shared.vacb_list.next(&state.vacbs, id);
        }
    }

    /// Usage summary, one line per cached file.
    pub fn debug_dump(&self) {
        let state = self.state.lock();
        debug!("Shared\tValid\tDirty\tName");
        for &map_id in &state.clean_maps {
            let Some(map) = state.map_opt(map_id) else {
                continue;
            };
            let mut valid_kb = 0usize;
            let mut cur = map.vacb_list.head();
            while let Some(id) = cur {
                if state.vacb(id).valid {
                    valid_kb += VACB_MAPPING_GRANULARITY / 1024;
                }
                cur = map.vacb_list.next(&state.vacbs, id);
            }
            debug!(
                "{}\t{}\t{}\t{}",
                map_id,
                valid_kb,
                map.dirty_pages as usize * PAGE_SIZE / 1024,
                map.file.name()
            );
        }
    }

    /// Counters snapshot.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            shared_cache_maps: state.live_map_count() as u32,
            vacbs: state.live_vacb_count() as u32,
            dirty_pages: self.total_dirty_pages(),
            dirty_page_threshold: self.dirty_page_threshold(),
        }
    }

    #[cfg(test)]
    pub(crate) fn vacb_ref_count(&self, vacb: VacbId) -> u32 {
        self.state.lock().vacb(vacb.0).ref_count
    }

    #[cfg(test)]
    pub(crate) fn vacb_is_dirty(&self, vacb: VacbId) -> bool {
        self.state.lock().vacb(vacb.0).dirty
    }
}

impl Drop for ViewCache {
    fn drop(&mut self) {
        // Shutdown: any window still in the arena gives its mapping back.
        let state = self.state.get_mut();
        for slot in state.vacbs.iter_mut() {
            if let Some(vacb) = slot.take() {
                self.provider
                    .release_region(vacb.base_address, VACB_MAPPING_GRANULARITY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::lazywrite::LazyWriterHook;
    use crate::mm::PoolViewProvider;
    use core::sync::atomic::AtomicBool;
    use std::sync::Barrier;

    const G: u64 = VACB_MAPPING_GRANULARITY as u64;

    struct TestBackingStore {
        writes: Mutex<Vec<(u64, usize)>>,
        fail_with: Mutex<Option<NtStatus>>,
        refuse_lazy_write: AtomicBool,
        acquires: AtomicU32,
        releases: AtomicU32,
    }

    impl TestBackingStore {
        fn new() -> Arc<TestBackingStore> {
            Arc::new(TestBackingStore {
                writes: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
                refuse_lazy_write: AtomicBool::new(false),
                acquires: AtomicU32::new(0),
                releases: AtomicU32::new(0),
            })
        }

        fn writes(&self) -> Vec<(u64, usize)> {
            self.writes.lock().clone()
        }

        fn fail_with(&self, status: Option<NtStatus>) {
            *self.fail_with.lock() = status;
        }
    }

    impl CacheCallbacks for TestBackingStore {
        fn acquire_for_lazy_write(&self, _wait: bool) -> bool {
            self.acquires.fetch_add(1, Ordering::Relaxed);
            !self.refuse_lazy_write.load(Ordering::Acquire)
        }

        fn release_from_lazy_write(&self) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }

        fn write_region(&self, region: &WriteRegion<'_>) -> NtStatus {
            if let Some(status) = *self.fail_with.lock() {
                return status;
            }
            self.writes.lock().push((region.file_offset, region.data.len()));
            NtStatus::Success
        }
    }

    struct CountingProvider {
        inner: PoolViewProvider,
        page_outs: AtomicU32,
    }

    impl CountingProvider {
        fn new() -> Arc<CountingProvider> {
            Arc::new(CountingProvider {
                inner: PoolViewProvider,
                page_outs: AtomicU32::new(0),
            })
        }
    }

    impl ViewProvider for CountingProvider {
        fn create_mapped_region(&self, length: usize) -> Result<*mut u8, NtStatus> {
            self.inner.create_mapped_region(length)
        }

        fn release_region(&self, base: *mut u8, length: usize) {
            self.inner.release_region(base, length);
        }

        fn page_out(&self, base: *mut u8, length: usize) {
            self.page_outs.fetch_add(1, Ordering::Relaxed);
            self.inner.page_out(base, length);
        }
    }

    struct CountingHook {
        scans: AtomicU32,
    }

    impl LazyWriterHook for CountingHook {
        fn schedule_scan(&self, _fast: bool) {
            self.scans.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn setup_with_provider(
        file_size: u64,
        provider: Arc<dyn ViewProvider>,
    ) -> (Arc<ViewCache>, Arc<FileObject>, CacheMapId, Arc<TestBackingStore>) {
        let cache = Arc::new(ViewCache::new(provider));
        let file = FileObject::new("\\test\\file.dat", FileFlags::empty());
        let store = TestBackingStore::new();
        let status = cache.initialize_file_cache(
            &file,
            FileSizes::with_size(file_size),
            false,
            store.clone(),
        );
        assert!(status.is_success());
        let map = cache.cache_map_of(&file).expect("map installed");
        (cache, file, map, store)
    }

    fn setup(file_size: u64) -> (Arc<ViewCache>, Arc<FileObject>, CacheMapId, Arc<TestBackingStore>) {
        setup_with_provider(file_size, Arc::new(PoolViewProvider))
    }

    fn dirty_window(cache: &ViewCache, map: CacheMapId, offset: u64) -> VacbId {
        let view = cache.request_region(map, offset).expect("request");
        unsafe { core::ptr::write_bytes(view.base_address, 0xAB, 4) };
        cache.release_region(map, view.vacb, true, true, false);
        view.vacb
    }

    #[test]
    fn create_write_flush_trim() {
        let (cache, _file, map, store) = setup(1024 * 1024);

        let view = cache.request_region(map, 0).expect("request");
        assert!(!view.up_to_date);
        unsafe { core::ptr::write_bytes(view.base_address, 0xAB, 4) };
        cache.release_region(map, view.vacb, true, true, false);

        assert!(cache.vacb_is_dirty(view.vacb));
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);
        assert_eq!(cache.stats().dirty_pages, VACB_PAGES);

        let flushed = cache.flush_dirty(1024, false);
        assert_eq!(flushed, VACB_PAGES);
        assert_eq!(store.writes(), [(0, VACB_MAPPING_GRANULARITY)]);
        assert!(!cache.vacb_is_dirty(view.vacb));
        assert_eq!(cache.total_dirty_pages(), 0);

        let freed = cache.trim_cache(1024, 0);
        assert_eq!(freed, VACB_PAGES);
        assert_eq!(cache.stats().vacbs, 0);
    }

    #[test]
    fn request_release_returns_ref_count_to_prior_value() {
        let (cache, _file, map, _store) = setup(1024 * 1024);

        let view = cache.request_region(map, 0).expect("request");
        assert_eq!(cache.vacb_ref_count(view.vacb), 2);
        cache.release_region(map, view.vacb, true, false, false);
        assert_eq!(cache.vacb_ref_count(view.vacb), 1);

        // the second request sees the same window, now up to date
        let again = cache.request_region(map, 0).expect("request");
        assert_eq!(again.base_address, view.base_address);
        assert!(again.up_to_date);
        assert_eq!(cache.vacb_ref_count(again.vacb), 2);
        cache.release_region(map, again.vacb, true, false, false);
    }

    #[test]
    fn concurrent_requests_install_one_window() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        let barrier = Arc::new(Barrier::new(2));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let view = cache.request_region(map, 0).expect("request");
                    let base = view.base_address as usize;
                    cache.release_region(map, view.vacb, true, false, false);
                    base
                })
            })
            .collect();

        let bases: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(bases[0], bases[1]);
        assert_eq!(cache.stats().vacbs, 1);
    }

    #[test]
    fn mark_dirty_is_idempotent_per_window() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);

        cache.mark_dirty(map, 0);
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);

        // releasing dirty again while already dirty changes nothing
        let view = cache.request_region(map, 0).expect("request");
        cache.release_region(map, view.vacb, true, true, false);
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);

        assert_eq!(cache.flush_dirty(1024, false), VACB_PAGES);
    }

    #[test]
    #[should_panic(expected = "bugcheck")]
    fn mark_dirty_without_a_window_bug_checks() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        cache.mark_dirty(map, 2 * G);
    }

    #[test]
    #[should_panic(expected = "bugcheck")]
    fn misaligned_requests_bug_check() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        let _ = cache.request_region(map, 512);
    }

    #[test]
    fn requests_beyond_the_section_fail() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        let status = cache.request_region(map, 8 * G).map(|_| ()).unwrap_err();
        assert_eq!(status, NtStatus::InvalidParameter);
    }

    #[test]
    fn mapped_windows_survive_trimming_until_unmapped() {
        let provider = CountingProvider::new();
        let (cache, _file, map, _store) = setup_with_provider(1024 * 1024, provider.clone());

        let view = cache.request_region(map, 0).expect("request");
        cache.release_region(map, view.vacb, true, false, true);
        assert_eq!(cache.vacb_ref_count(view.vacb), 2);

        // mapped and clean: trimming pages the frames out but cannot evict
        assert_eq!(cache.trim_cache(1024, 0), 0);
        assert_eq!(provider.page_outs.load(Ordering::Relaxed), VACB_PAGES);
        assert_eq!(cache.stats().vacbs, 1);

        assert!(cache.unmap_region(map, 0, false).is_success());
        assert_eq!(cache.trim_cache(1024, 0), VACB_PAGES);
        assert_eq!(cache.stats().vacbs, 0);
    }

    #[test]
    fn flush_failures_keep_the_window_dirty() {
        let (cache, _file, map, store) = setup(1024 * 1024);
        let vacb = dirty_window(&cache, map, 0);

        store.fail_with(Some(NtStatus::Unsuccessful));
        assert_eq!(cache.flush_dirty(1024, false), 0);
        assert!(cache.vacb_is_dirty(vacb));
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);

        store.fail_with(None);
        assert_eq!(cache.flush_dirty(1024, false), VACB_PAGES);
        assert!(!cache.vacb_is_dirty(vacb));
        assert_eq!(store.writes().len(), 1);
    }

    #[test]
    fn end_of_file_counts_as_handled_but_stays_dirty() {
        let (cache, _file, map, store) = setup(1024 * 1024);
        let vacb = dirty_window(&cache, map, 0);

        store.fail_with(Some(NtStatus::EndOfFile));
        assert_eq!(cache.flush_dirty(VACB_PAGES, false), VACB_PAGES);
        assert!(cache.vacb_is_dirty(vacb));
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);
    }

    #[test]
    fn refused_lazy_write_lock_skips_the_window() {
        let (cache, _file, map, store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);

        store.refuse_lazy_write.store(true, Ordering::Release);
        assert_eq!(cache.flush_dirty(1024, true), 0);
        assert!(store.writes().is_empty());
        assert_eq!(store.releases.load(Ordering::Relaxed), 0);

        store.refuse_lazy_write.store(false, Ordering::Release);
        assert_eq!(cache.flush_dirty(1024, true), VACB_PAGES);
        assert_eq!(
            store.acquires.load(Ordering::Relaxed),
            store.releases.load(Ordering::Relaxed) + 1
        );
    }

    #[test]
    fn windows_with_borrowers_are_too_hot_to_flush() {
        let (cache, _file, map, store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);

        let view = cache.request_region(map, 0).expect("request");
        assert_eq!(cache.flush_dirty(1024, false), 0);
        assert!(store.writes().is_empty());

        cache.release_region(map, view.vacb, true, false, false);
        assert_eq!(cache.flush_dirty(1024, false), VACB_PAGES);
        assert_eq!(store.writes().len(), 1);
    }

    #[test]
    fn lazy_writer_skips_temporary_files() {
        let cache = Arc::new(ViewCache::new(Arc::new(PoolViewProvider)));
        let file = FileObject::new("\\temp\\scratch", FileFlags::TEMPORARY);
        let store = TestBackingStore::new();
        assert!(cache
            .initialize_file_cache(&file, FileSizes::with_size(G), false, store.clone())
            .is_success());
        let map = cache.cache_map_of(&file).unwrap();
        dirty_window(&cache, map, 0);

        // the lazy path leaves temporary files alone, explicit flushing
        // still writes them
        assert_eq!(cache.flush_dirty(1024, true), 0);
        assert!(store.writes().is_empty());
        assert_eq!(cache.flush_dirty(1024, false), VACB_PAGES);
        assert_eq!(store.writes().len(), 1);
    }

    #[test]
    fn flush_cache_honors_the_requested_range() {
        let (cache, file, map, store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);
        dirty_window(&cache, map, G);
        assert_eq!(cache.total_dirty_pages(), 2 * VACB_PAGES);

        assert!(cache.flush_cache(file.section(), Some(0), G).is_success());
        assert_eq!(store.writes(), [(0, VACB_MAPPING_GRANULARITY)]);
        assert_eq!(cache.total_dirty_pages(), VACB_PAGES);

        assert!(cache.flush_cache(file.section(), None, 0).is_success());
        assert_eq!(cache.total_dirty_pages(), 0);
        assert_eq!(store.writes().len(), 2);
    }

    #[test]
    fn flush_cache_reports_the_first_failure() {
        let (cache, file, map, store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);
        store.fail_with(Some(NtStatus::MediaWriteProtected));
        let status = cache.flush_cache(file.section(), None, 0);
        assert_eq!(status, NtStatus::MediaWriteProtected);
    }

    #[test]
    fn release_file_cache_flushes_and_tears_down() {
        let (cache, file, map, store) = setup(1024 * 1024);
        dirty_window(&cache, map, 0);

        assert!(cache.release_file_cache(&file).is_success());
        assert_eq!(store.writes().len(), 1);
        assert_eq!(cache.stats().shared_cache_maps, 0);
        assert_eq!(cache.stats().vacbs, 0);
        assert_eq!(cache.total_dirty_pages(), 0);
        assert!(cache.cache_map_of(&file).is_none());
    }

    #[test]
    fn teardown_defers_to_the_last_releaser() {
        let (cache, file, map, _store) = setup(1024 * 1024);
        let view = cache.request_region(map, 0).expect("request");

        // a reference is still out when the last handle goes away
        assert!(cache.release_file_cache(&file).is_success());
        assert_eq!(cache.stats().shared_cache_maps, 0);
        assert_eq!(cache.stats().vacbs, 1);

        // the last releaser destroys the window
        cache.release_region(map, view.vacb, true, false, false);
        assert_eq!(cache.stats().vacbs, 0);
    }

    #[test]
    fn second_handle_keeps_the_map_alive() {
        let (cache, file, map, store) = setup(1024 * 1024);
        let second = FileObject::new("\\test\\file.dat", FileFlags::empty());
        second.section().set_shared_cache_map(Some(map.0));
        assert!(cache
            .initialize_file_cache(
                &second,
                FileSizes::with_size(1024 * 1024),
                false,
                store.clone()
            )
            .is_success());

        assert!(cache.release_file_cache(&file).is_success());
        assert_eq!(cache.stats().shared_cache_maps, 1);
        assert!(cache.release_file_cache(&second).is_success());
        assert_eq!(cache.stats().shared_cache_maps, 0);
    }

    #[test]
    fn section_pointers_resolve_back_to_the_file() {
        let (cache, file, _map, _store) = setup(1024 * 1024);
        let resolved = cache
            .get_file_object_from_section(file.section())
            .expect("resolves");
        assert!(Arc::ptr_eq(&resolved, &file));
    }

    #[test]
    fn dirty_marking_schedules_one_lazy_scan() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        let hook = Arc::new(CountingHook {
            scans: AtomicU32::new(0),
        });
        cache.set_lazy_writer_hook(hook.clone());

        dirty_window(&cache, map, 0);
        assert_eq!(hook.scans.load(Ordering::Relaxed), 1);
        assert!(cache.lazy_writer_active());

        // further dirty data does not re-schedule while the scan is armed
        dirty_window(&cache, map, G);
        assert_eq!(hook.scans.load(Ordering::Relaxed), 1);

        // each pass writes a fraction of the dirty total and re-arms
        // itself while dirty data remains
        assert_eq!(cache.lazy_write_pass(), VACB_PAGES);
        assert!(cache.lazy_writer_active());
        assert_eq!(hook.scans.load(Ordering::Relaxed), 2);

        assert_eq!(cache.lazy_write_pass(), VACB_PAGES);
        assert!(!cache.lazy_writer_active());
        assert_eq!(hook.scans.load(Ordering::Relaxed), 2);

        dirty_window(&cache, map, 2 * G);
        assert_eq!(hook.scans.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn write_throttling_parks_and_readmits_writers() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        cache.set_dirty_page_threshold(VACB_PAGES);
        assert!(cache.can_i_write(4096, false, false));

        dirty_window(&cache, map, 0);
        assert!(!cache.can_i_write(4096, false, false));
        assert!(!cache.can_i_write(4096, true, false));
        assert_eq!(cache.deferred_write_count(), 1);
        assert!(cache.lazy_writer_active());

        assert_eq!(cache.lazy_write_pass(), VACB_PAGES);
        let admitted = cache.post_deferred_writes();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].bytes_to_write, 4096);
        assert!(cache.can_i_write(4096, false, false));
        assert_eq!(cache.deferred_write_count(), 0);
    }

    #[test]
    fn sequential_reads_grow_a_read_ahead_window() {
        let (cache, file, _map, _store) = setup(1024 * 1024);
        // a seek, then two reads that continue where the last one ended
        assert!(cache.note_read(&file, 4096, 4096).is_none());
        assert!(cache.note_read(&file, 8192, 4096).is_none());
        let (next, length) = cache.note_read(&file, 12288, 4096).expect("sequential");
        assert_eq!(next, 16384);
        assert!(length >= VACB_MAPPING_GRANULARITY as u32);

        // another seek resets the detector
        assert!(cache.note_read(&file, 0, 4096).is_none());
    }

    #[test]
    fn the_cached_file_limit_unwinds_cleanly() {
        let cache = Arc::new(ViewCache::new(Arc::new(PoolViewProvider)));
        let store = TestBackingStore::new();
        let mut files = Vec::new();
        for index in 0..MAX_CACHED_FILES {
            let file = FileObject::new(&std::format!("\\spool\\{}", index), FileFlags::empty());
            assert!(cache
                .initialize_file_cache(&file, FileSizes::with_size(G), false, store.clone())
                .is_success());
            files.push(file);
        }
        let overflow = FileObject::new("\\spool\\overflow", FileFlags::empty());
        let status =
            cache.initialize_file_cache(&overflow, FileSizes::with_size(G), false, store.clone());
        assert_eq!(status, NtStatus::InsufficientResources);
        assert!(cache.cache_map_of(&overflow).is_none());
        assert_eq!(cache.stats().shared_cache_maps, MAX_CACHED_FILES as u32);

        for file in &files {
            assert!(cache.release_file_cache(file).is_success());
        }
        assert_eq!(cache.stats().shared_cache_maps, 0);
    }

    #[test]
    fn tracing_and_dump_are_side_effect_free() {
        let (cache, _file, map, _store) = setup(1024 * 1024);
        let vacb = dirty_window(&cache, map, 0);
        cache.set_trace(map, true);
        let refs_before = cache.vacb_ref_count(vacb);
        cache.debug_dump();
        cache.set_trace(map, false);
        assert_eq!(cache.vacb_ref_count(vacb), refs_before);
        assert_eq!(cache.flush_dirty(1024, false), VACB_PAGES);
    }
}
