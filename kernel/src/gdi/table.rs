//! GDI handle table and object manager
//!
//! The table is a fixed array of slots. Each slot is four words:
//!
//! - `kernel_data`: pointer to the object body, or — while the slot is
//!   free — the index of the next free slot
//! - `owner`: owning process id shifted up one bit; bit 0 is the slot
//!   spinlock. An actor locks a slot by compare-exchanging `owner` from
//!   `pid` to `pid | 1`, mutates, then writes back the (possibly new)
//!   owner. Zero identifies global objects.
//! - `type_info`: base type, stock flag and reuse counter in the lower
//!   half (the part snapshotted into handles), preserved flags above
//! - `user_data`: user-mode shadow, opaque here
//!
//! Free slots form a lock-free stack headed by `first_free`; slots that
//! have never been allocated come from the `first_unused` bump frontier.
//! The slot lock bit bounds the ABA hazard on pop: a popper holds the
//! candidate slot locked while reading its next link, so the link cannot
//! change under it.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::mem::align_of;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use log::{debug, trace, warn};
use spin::Mutex;

use crate::bugcheck;
use crate::ke::bugcheck::codes::GDI_OBJECT_MANAGER;
use crate::ke::SpinWait;
use crate::ps::{self, ProcessId, TaskIds};

use super::handle::{
    GdiHandle, GdiObjectType, ENTRY_BASETYPE_MASK, ENTRY_FLAGS_MASK, ENTRY_REUSE_INC,
    ENTRY_REUSE_MASK, ENTRY_STOCK_MASK, ENTRY_UPPER_SHIFT,
};
use super::object::{BaseFlags, BaseObject, BASE_OBJTYPE_COUNT, OBJ_TYPE_INFO};
use super::{GDI_HANDLE_QUOTA, RESERVE_ENTRIES_COUNT};

/// Low bit of the owner word: slot locked by someone mid-transition.
const LOCK_BIT: usize = 1;

/// Depth of each per-type lookaside cache.
const LOOKASIDE_DEPTH: usize = 32;

#[inline]
fn owner_word(pid: ProcessId) -> usize {
    (pid.0 as usize) << 1
}

#[inline]
fn owner_pid(word: usize) -> u32 {
    (word >> 1) as u32
}

fn body_layout(size: usize) -> Layout {
    match Layout::from_size_align(size, align_of::<BaseObject>()) {
        Ok(layout) => layout,
        Err(_) => bugcheck!(GDI_OBJECT_MANAGER, "bad body size {:#x}", size),
    }
}

/// One cell of the handle table.
#[repr(C)]
pub(crate) struct GdiTableEntry {
    kernel_data: AtomicUsize,
    owner: AtomicUsize,
    type_info: AtomicU32,
    user_data: AtomicUsize,
}

impl GdiTableEntry {
    fn new() -> Self {
        Self {
            kernel_data: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            type_info: AtomicU32::new(0),
            user_data: AtomicUsize::new(0),
        }
    }
}

/// Object manager statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdiTableStats {
    pub dc_count: i32,
    pub surface_count: i32,
    pub palette_count: i32,
    pub brush_count: i32,
    pub total_handles: u32,
}

/// The GDI handle table.
pub struct GdiHandleTable {
    entries: Box<[GdiTableEntry]>,
    /// Head of the free-slot stack; zero means empty.
    first_free: AtomicU32,
    /// Bump frontier over never-allocated slots.
    first_unused: AtomicU32,
    lookasides: Vec<Mutex<Vec<usize>>>,
    handle_counts: Mutex<BTreeMap<u32, u32>>,
    object_counts: [AtomicI32; BASE_OBJTYPE_COUNT],
    cleanup_runs: [AtomicU32; BASE_OBJTYPE_COUNT],
    #[cfg(test)]
    cleanup_trace: Mutex<Vec<u32>>,
}

impl GdiHandleTable {
    /// Allocate a handle table with `entry_count` slots.
    pub fn new(entry_count: usize) -> GdiHandleTable {
        if entry_count <= RESERVE_ENTRIES_COUNT as usize || entry_count > 0x10000 {
            bugcheck!(GDI_OBJECT_MANAGER, "bad handle table size {}", entry_count);
        }
        let entries = (0..entry_count)
            .map(|_| GdiTableEntry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let lookasides = (0..BASE_OBJTYPE_COUNT).map(|_| Mutex::new(Vec::new())).collect();
        GdiHandleTable {
            entries,
            first_free: AtomicU32::new(0),
            first_unused: AtomicU32::new(RESERVE_ENTRIES_COUNT),
            lookasides,
            handle_counts: Mutex::new(BTreeMap::new()),
            object_counts: [const { AtomicI32::new(0) }; BASE_OBJTYPE_COUNT],
            cleanup_runs: [const { AtomicU32::new(0) }; BASE_OBJTYPE_COUNT],
            #[cfg(test)]
            cleanup_trace: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn entry(&self, index: u32) -> &GdiTableEntry {
        &self.entries[index as usize]
    }

    fn adjust_handle_count(&self, pid: ProcessId, delta: i32) {
        if pid.0 == 0 {
            return;
        }
        let mut counts = self.handle_counts.lock();
        let slot = counts.entry(pid.0).or_insert(0);
        if delta < 0 {
            *slot = slot.saturating_sub(delta.unsigned_abs());
            if *slot == 0 {
                counts.remove(&pid.0);
            }
        } else {
            *slot += delta as u32;
        }
    }

    /// Handles currently charged to `pid`.
    pub fn process_handle_count(&self, pid: ProcessId) -> u32 {
        *self.handle_counts.lock().get(&pid.0).unwrap_or(&0)
    }

    // ------------------------------------------------------------------
    // Free list
    // ------------------------------------------------------------------

    /// Pop a slot index off the free stack, or take one from the bump
    /// frontier. Returns `None` when the table is exhausted.
    fn pop_free_entry(&self) -> Option<u32> {
        let mut wait = SpinWait::new();
        loop {
            let idx_first = self.first_free.load(Ordering::Acquire);
            if idx_first == 0 {
                let index = self.first_unused.fetch_add(1, Ordering::AcqRel);
                if index as usize >= self.entries.len() {
                    warn!("no more gdi handles left");
                    return None;
                }
                return Some(index);
            }

            let entry = self.entry(idx_first);
            // Lock the candidate so its next link stays put while we
            // swing the head.
            if entry
                .owner
                .compare_exchange(0, LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }

            let idx_next = entry.kernel_data.load(Ordering::Relaxed) as u32;
            let swapped = self
                .first_free
                .compare_exchange(idx_first, idx_next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok();
            entry.owner.store(0, Ordering::Release);
            if swapped {
                return Some(idx_first);
            }
        }
    }

    /// Push an unlocked slot whose base type is already cleared onto the
    /// free stack.
    fn push_free_entry(&self, index: u32) {
        let entry = self.entry(index);
        debug_assert_eq!(entry.type_info.load(Ordering::Relaxed) & ENTRY_BASETYPE_MASK, 0);
        debug_assert_eq!(entry.owner.load(Ordering::Relaxed), 0);
        entry.user_data.store(0, Ordering::Relaxed);
        loop {
            let idx_first = self.first_free.load(Ordering::Acquire);
            entry.kernel_data.store(idx_first as usize, Ordering::Relaxed);
            if self
                .first_free
                .compare_exchange(idx_first, index, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Body allocation
    // ------------------------------------------------------------------

    fn alloc_object_body(&self, base_type: u32) -> *mut BaseObject {
        let info = &OBJ_TYPE_INFO[base_type as usize];
        if info.use_lookaside {
            if let Some(raw) = self.lookasides[base_type as usize].lock().pop() {
                unsafe { core::ptr::write_bytes(raw as *mut u8, 0, info.body_size) };
                return raw as *mut BaseObject;
            }
        }
        unsafe { alloc_zeroed(body_layout(info.body_size)) as *mut BaseObject }
    }

    fn free_object_body(&self, base_type: u32, body: *mut BaseObject) {
        let info = &OBJ_TYPE_INFO[base_type as usize];
        if info.use_lookaside {
            let mut cache = self.lookasides[base_type as usize].lock();
            if cache.len() < LOOKASIDE_DEPTH {
                cache.push(body as usize);
                return;
            }
        }
        unsafe { dealloc(body as *mut u8, body_layout(info.body_size)) };
    }

    // ------------------------------------------------------------------
    // Allocation / free
    // ------------------------------------------------------------------

    /// Allocate a body of the given type and a handle for it.
    ///
    /// The returned object holds its initial exclusive lock (depth 1),
    /// owned by the calling thread.
    pub fn alloc_object_with_handle(&self, object_type: GdiObjectType) -> Option<&BaseObject> {
        let task = ps::current_task();
        let pid = task.process;

        if self.process_handle_count(pid) >= GDI_HANDLE_QUOTA {
            warn!("too many gdi objects for process {:x}", pid.0);
            return None;
        }

        let base_type = object_type.type_index();
        let info = &OBJ_TYPE_INFO[base_type as usize];
        if info.body_size == 0 {
            bugcheck!(GDI_OBJECT_MANAGER, "allocation from reserved type {:#x}", base_type);
        }

        let body = self.alloc_object_body(base_type);
        if body.is_null() {
            warn!("not enough memory to allocate gdi object");
            return None;
        }

        let Some(index) = self.pop_free_entry() else {
            self.free_object_body(base_type, body);
            warn!("failed to insert gdi object into the handle table, no handles left");
            return None;
        };

        let entry = self.entry(index);
        let locked = owner_word(pid) | LOCK_BIT;
        let mut wait = SpinWait::new();
        while entry
            .owner
            .compare_exchange(0, locked, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // someone is still poking the retired generation of this slot
            wait.delay();
        }

        // Carry the reuse counter over from the retired generation.
        let type_info = base_type | (entry.type_info.load(Ordering::Relaxed) & ENTRY_REUSE_MASK);
        entry.kernel_data.store(body as usize, Ordering::Relaxed);
        entry.type_info.store(type_info, Ordering::Relaxed);

        let handle = GdiHandle::compose(index, type_info);
        let object = unsafe { &*body };
        object.handle.store(handle.0, Ordering::Relaxed);
        object.share_count.store(0, Ordering::Relaxed);
        object.exclusive_lock.store(1, Ordering::Relaxed);
        object.owning_tid.store(task.thread.0, Ordering::Relaxed);
        object.flags.store(0, Ordering::Relaxed);

        self.object_counts[base_type as usize].fetch_add(1, Ordering::Relaxed);
        entry.owner.store(owner_word(pid), Ordering::Release);
        self.adjust_handle_count(pid, 1);

        trace!("allocated gdi object {:08x} at {:p}", handle.0, body);
        Some(object)
    }

    /// Free the object behind `handle`.
    ///
    /// Returns `false` without touching the object when it is share
    /// locked (the last share unlock finishes the job), when the handle
    /// is stale, foreign or global. With `silent` unset, stale and
    /// wrong-type frees are caller bugs and bug check.
    pub fn free_by_handle(
        &self,
        handle: GdiHandle,
        expected: Option<GdiObjectType>,
        silent: bool,
    ) -> bool {
        self.free_by_handle_for(handle, expected, silent, ps::current_task())
    }

    fn free_by_handle_for(
        &self,
        handle: GdiHandle,
        expected: Option<GdiObjectType>,
        silent: bool,
        task: TaskIds,
    ) -> bool {
        if handle.is_stock() {
            bugcheck!(GDI_OBJECT_MANAGER, "attempt to delete stock object {:08x}", handle.0);
        }

        if handle.index() as usize >= self.entries.len()
            || handle.basetype() == 0
            || expected.is_some_and(|t| t.type_index() != handle.basetype())
        {
            if silent {
                return false;
            }
            bugcheck!(GDI_OBJECT_MANAGER, "free of invalid handle {:08x}", handle.0);
        }

        let pid = task.process;
        let entry = self.entry(handle.index());
        let unlocked = owner_word(pid);
        let mut wait = SpinWait::new();

        loop {
            // Lock the slot. Global objects must not be deleted, so only
            // exchange against our own unlocked owner word.
            if let Err(observed) = entry.owner.compare_exchange(
                unlocked,
                unlocked | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                if observed & LOCK_BIT != 0 {
                    // mid-transition, wait and try again
                    wait.delay();
                    continue;
                }
                if entry.type_info.load(Ordering::Relaxed) & ENTRY_BASETYPE_MASK == 0 {
                    if silent {
                        return false;
                    }
                    bugcheck!(GDI_OBJECT_MANAGER, "double free of gdi handle {:08x}", handle.0);
                }
                if !silent {
                    if owner_pid(observed) == 0 {
                        warn!(
                            "attempt to free global gdi handle {:08x}, take ownership first",
                            handle.0
                        );
                    } else {
                        warn!(
                            "attempt to free foreign handle {:08x} (owner {:x}, caller {:x})",
                            handle.0,
                            owner_pid(observed),
                            pid.0
                        );
                    }
                }
                return false;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            if kernel_data == 0 || (e_type << ENTRY_UPPER_SHIFT) != handle.upper() {
                lock_error_debug_output(handle, e_type, "free_by_handle");
                entry.owner.store(unlocked, Ordering::Release);
                if silent {
                    return false;
                }
                bugcheck!(GDI_OBJECT_MANAGER, "free of invalid handle {:08x}", handle.0);
            }

            let object = unsafe { &*(kernel_data as *const BaseObject) };
            if object.share_count.load(Ordering::Acquire) != 0 {
                // Don't wait on shared locks: flag it and let the last
                // share unlock destroy it.
                object
                    .flags
                    .fetch_or(BaseFlags::READY_TO_DIE.bits(), Ordering::AcqRel);
                debug!(
                    "object {:08x} share locked ({}), deferring destruction",
                    handle.0,
                    object.share_count.load(Ordering::Relaxed)
                );
                entry.owner.store(unlocked, Ordering::Release);
                return false;
            }

            let depth = object.exclusive_lock.load(Ordering::Acquire);
            if depth != 0 && object.owning_tid.load(Ordering::Acquire) != task.thread.0 {
                // Exclusively locked by another thread, freeing is
                // forbidden right now.
                entry.owner.store(unlocked, Ordering::Release);
                wait.delay();
                continue;
            }

            return self.destroy_locked(handle.index(), handle.basetype(), unlocked, object);
        }
    }

    /// Retire a locked slot and destroy its body. The caller holds the
    /// slot lock; the previous (unlocked) owner word is `owner_unlocked`.
    fn destroy_locked(
        &self,
        index: u32,
        base_type: u32,
        owner_unlocked: usize,
        object: &BaseObject,
    ) -> bool {
        let entry = self.entry(index);
        let e_type = entry.type_info.load(Ordering::Relaxed);

        // Retire this generation: clear the base type (and stock bit),
        // advance the reuse counter modulo its width, keep upper flags.
        let reuse = e_type.wrapping_add(ENTRY_REUSE_INC) & ENTRY_REUSE_MASK;
        entry
            .type_info
            .store((e_type & ENTRY_FLAGS_MASK) | reuse, Ordering::Relaxed);

        entry.owner.store(0, Ordering::Release);
        self.push_free_entry(index);

        object.handle.store(0, Ordering::Relaxed);
        self.adjust_handle_count(ProcessId(owner_pid(owner_unlocked)), -1);

        let info = &OBJ_TYPE_INFO[base_type as usize];
        let body = object as *const BaseObject as *mut BaseObject;
        let survived = match info.cleanup {
            Some(cleanup) => {
                self.cleanup_runs[base_type as usize].fetch_add(1, Ordering::Relaxed);
                #[cfg(test)]
                self.cleanup_trace.lock().push(base_type);
                cleanup(body)
            }
            None => true,
        };

        self.free_object_body(base_type, body);
        self.object_counts[base_type as usize].fetch_sub(1, Ordering::Relaxed);
        survived
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Take the object's exclusive lock. Reentrant per thread; spins
    /// while another thread holds it.
    pub fn lock_object(
        &self,
        handle: GdiHandle,
        expected: Option<GdiObjectType>,
    ) -> Option<&BaseObject> {
        if handle.index() as usize >= self.entries.len() {
            return None;
        }
        if handle.basetype() == 0 || expected.is_some_and(|t| t.type_index() != handle.basetype()) {
            warn!(
                "attempt to lock object {:08x} of wrong type (requested {:?})",
                handle.0, expected
            );
            return None;
        }

        let task = ps::current_task();
        let entry = self.entry(handle.index());
        let mut wait = SpinWait::new();

        loop {
            let observed = entry.owner.load(Ordering::Acquire);
            if observed & LOCK_BIT != 0 {
                wait.delay();
                continue;
            }
            let holder = owner_pid(observed);
            if holder != 0 && holder != task.process.0 {
                warn!(
                    "attempt to lock object {:08x} of wrong owner (owner {:x}, caller {:x})",
                    handle.0, holder, task.process.0
                );
                return None;
            }
            if entry
                .owner
                .compare_exchange(observed, observed | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            let result;
            if kernel_data != 0 && (e_type << ENTRY_UPPER_SHIFT) == handle.upper() {
                let object = unsafe { &*(kernel_data as *const BaseObject) };
                if object.exclusive_lock.load(Ordering::Acquire) == 0 {
                    object.owning_tid.store(task.thread.0, Ordering::Relaxed);
                    object.exclusive_lock.store(1, Ordering::Release);
                    result = Some(object);
                } else if object.owning_tid.load(Ordering::Acquire) == task.thread.0 {
                    object.exclusive_lock.fetch_add(1, Ordering::AcqRel);
                    result = Some(object);
                } else {
                    // held by another thread; release the slot and retry
                    entry.owner.store(observed, Ordering::Release);
                    wait.delay();
                    continue;
                }
            } else {
                lock_error_debug_output(handle, e_type, "lock_object");
                result = None;
            }
            entry.owner.store(observed, Ordering::Release);
            return result;
        }
    }

    /// Release one level of the exclusive lock.
    pub fn unlock_object(&self, object: &BaseObject) {
        let previous = object.exclusive_lock.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            bugcheck!(
                GDI_OBJECT_MANAGER,
                "unlock of unlocked object {:08x}",
                object.handle.load(Ordering::Relaxed)
            );
        }
    }

    /// Take a shared reference to the object. Does not interact with the
    /// exclusive lock; global objects may be share locked by anyone.
    pub fn share_lock_object(
        &self,
        handle: GdiHandle,
        expected: Option<GdiObjectType>,
    ) -> Option<&BaseObject> {
        if handle.index() as usize >= self.entries.len() {
            return None;
        }
        if handle.basetype() == 0 || expected.is_some_and(|t| t.type_index() != handle.basetype()) {
            warn!(
                "attempt to share lock object {:08x} of wrong type (requested {:?})",
                handle.0, expected
            );
            return None;
        }

        let task = ps::current_task();
        let entry = self.entry(handle.index());
        let mut wait = SpinWait::new();

        loop {
            let observed = entry.owner.load(Ordering::Acquire);
            if observed & LOCK_BIT != 0 {
                wait.delay();
                continue;
            }
            let holder = owner_pid(observed);
            if holder != 0 && holder != task.process.0 {
                return None;
            }
            if entry
                .owner
                .compare_exchange(observed, observed | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            let result;
            if kernel_data != 0 && (e_type << ENTRY_UPPER_SHIFT) == handle.upper() {
                let object = unsafe { &*(kernel_data as *const BaseObject) };
                object.share_count.fetch_add(1, Ordering::AcqRel);
                result = Some(object);
            } else {
                lock_error_debug_output(handle, e_type, "share_lock_object");
                result = None;
            }
            entry.owner.store(observed, Ordering::Release);
            return result;
        }
    }

    /// Drop a shared reference. The last unshare of an object flagged
    /// ready-to-die completes its destruction.
    pub fn share_unlock(&self, object: &BaseObject) -> u32 {
        let previous = object.share_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            bugcheck!(
                GDI_OBJECT_MANAGER,
                "share unlock of unshared object {:08x}",
                object.handle.load(Ordering::Relaxed)
            );
        }
        let remaining = previous - 1;
        if remaining == 0
            && object.flags.load(Ordering::Acquire) & BaseFlags::READY_TO_DIE.bits() != 0
        {
            self.destroy_deferred(object);
        }
        remaining
    }

    fn destroy_deferred(&self, object: &BaseObject) {
        let handle = GdiHandle(object.handle.load(Ordering::Acquire));
        if handle.is_null() || handle.index() as usize >= self.entries.len() {
            return;
        }
        let entry = self.entry(handle.index());
        let mut wait = SpinWait::new();
        loop {
            let observed = entry.owner.load(Ordering::Acquire);
            if observed & LOCK_BIT != 0 {
                wait.delay();
                continue;
            }
            if entry
                .owner
                .compare_exchange(observed, observed | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }
            let e_type = entry.type_info.load(Ordering::Relaxed);
            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            if kernel_data != object as *const BaseObject as usize
                || e_type & ENTRY_BASETYPE_MASK == 0
                || object.share_count.load(Ordering::Acquire) != 0
            {
                // someone re-shared it or finished the destruction first
                entry.owner.store(observed, Ordering::Release);
                return;
            }
            debug!("completing deferred destruction of {:08x}", handle.0);
            self.destroy_locked(handle.index(), e_type & ENTRY_BASETYPE_MASK, observed, object);
            return;
        }
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Turn the object into a stock object: set the stock bit in its
    /// type word, rewrite `handle` to carry it, and globalize ownership.
    /// Idempotent on handles that already carry the stock bit.
    pub fn convert_to_stock(&self, handle: &mut GdiHandle) -> bool {
        let current = *handle;
        if current.is_stock() {
            return true;
        }
        if current.index() as usize >= self.entries.len() || current.basetype() == 0 {
            warn!("attempt to convert invalid handle {:08x}", current.0);
            return false;
        }

        let task = ps::current_task();
        let unlocked = owner_word(task.process);
        let entry = self.entry(current.index());
        let mut wait = SpinWait::new();

        loop {
            if let Err(observed) = entry.owner.compare_exchange(
                unlocked,
                unlocked | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                if observed & LOCK_BIT != 0 {
                    wait.delay();
                    continue;
                }
                warn!(
                    "attempt to convert handle {:08x} not owned by caller (owner {:x})",
                    current.0,
                    owner_pid(observed)
                );
                return false;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            if kernel_data == 0
                || e_type & ENTRY_BASETYPE_MASK == 0
                || (e_type << ENTRY_UPPER_SHIFT) != current.upper()
            {
                warn!("attempt to convert deleted object {:08x}", current.0);
                entry.owner.store(unlocked, Ordering::Release);
                return false;
            }

            let object = unsafe { &*(kernel_data as *const BaseObject) };
            let depth = object.exclusive_lock.load(Ordering::Acquire);
            if depth != 0 && object.owning_tid.load(Ordering::Acquire) != task.thread.0 {
                entry.owner.store(unlocked, Ordering::Release);
                wait.delay();
                continue;
            }

            // Stock bit goes in on the composed type value; flags and
            // reuse counter ride along untouched.
            if entry
                .type_info
                .compare_exchange(e_type, e_type | ENTRY_STOCK_MASK, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                entry.owner.store(unlocked, Ordering::Release);
                wait.delay();
                continue;
            }

            self.adjust_handle_count(task.process, -1);
            let stock_handle = current.as_stock();
            object.handle.store(stock_handle.0, Ordering::Relaxed);
            *handle = stock_handle;
            // drop the process lock and make it global
            entry.owner.store(0, Ordering::Release);
            return true;
        }
    }

    /// Reassign the slot's owner, moving the handle charge between
    /// process accounts. `None` makes the object global.
    pub fn set_ownership(&self, handle: GdiHandle, new_owner: Option<ProcessId>) -> bool {
        if handle.is_stock() {
            warn!("attempt to change ownership of stock object {:08x}", handle.0);
            return false;
        }
        if handle.index() as usize >= self.entries.len() {
            return false;
        }

        let task = ps::current_task();
        let entry = self.entry(handle.index());
        let mut wait = SpinWait::new();

        loop {
            let observed = entry.owner.load(Ordering::Acquire);
            if observed & LOCK_BIT != 0 {
                wait.delay();
                continue;
            }
            let holder = owner_pid(observed);
            if holder != 0 && holder != task.process.0 {
                warn!(
                    "attempt to change ownership of {:08x} owned by {:x} from {:x}",
                    handle.0, holder, task.process.0
                );
                return false;
            }
            if entry
                .owner
                .compare_exchange(observed, observed | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            if e_type & ENTRY_BASETYPE_MASK == 0 || (e_type << ENTRY_UPPER_SHIFT) != handle.upper() {
                warn!(
                    "attempt to change ownership of object {:08x} being destroyed",
                    handle.0
                );
                entry.owner.store(observed, Ordering::Release);
                return false;
            }

            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            let object = unsafe { &*(kernel_data as *const BaseObject) };
            let depth = object.exclusive_lock.load(Ordering::Acquire);
            if depth != 0 && object.owning_tid.load(Ordering::Acquire) != task.thread.0 {
                entry.owner.store(observed, Ordering::Release);
                wait.delay();
                continue;
            }

            if holder != 0 {
                self.adjust_handle_count(ProcessId(holder), -1);
            }
            let new_word = match new_owner {
                Some(pid) => {
                    self.adjust_handle_count(pid, 1);
                    owner_word(pid)
                }
                None => 0,
            };
            entry.owner.store(new_word, Ordering::Release);
            return true;
        }
    }

    /// Give `copy_to` the same owner `copy_from` currently has.
    pub fn copy_ownership(&self, copy_from: GdiHandle, copy_to: GdiHandle) -> bool {
        if copy_from.is_stock() || copy_to.is_stock() {
            warn!(
                "attempt to copy ownership involving stock objects ({:08x} -> {:08x})",
                copy_from.0, copy_to.0
            );
            return false;
        }
        if copy_from.index() as usize >= self.entries.len() {
            return false;
        }

        let task = ps::current_task();
        let entry = self.entry(copy_from.index());
        let mut wait = SpinWait::new();

        let from_owner = loop {
            let observed = entry.owner.load(Ordering::Acquire);
            if observed & LOCK_BIT != 0 {
                wait.delay();
                continue;
            }
            if entry
                .owner
                .compare_exchange(observed, observed | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                wait.delay();
                continue;
            }

            let e_type = entry.type_info.load(Ordering::Relaxed);
            if e_type & ENTRY_BASETYPE_MASK == 0 || (e_type << ENTRY_UPPER_SHIFT) != copy_from.upper()
            {
                warn!(
                    "attempt to copy ownership from deleted object {:08x}",
                    copy_from.0
                );
                entry.owner.store(observed, Ordering::Release);
                return false;
            }

            let kernel_data = entry.kernel_data.load(Ordering::Relaxed);
            let object = unsafe { &*(kernel_data as *const BaseObject) };
            let depth = object.exclusive_lock.load(Ordering::Acquire);
            if depth != 0 && object.owning_tid.load(Ordering::Acquire) != task.thread.0 {
                entry.owner.store(observed, Ordering::Release);
                wait.delay();
                continue;
            }

            entry.owner.store(observed, Ordering::Release);
            break owner_pid(observed);
        };

        self.set_ownership(copy_to, (from_owner != 0).then_some(ProcessId(from_owner)))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Stateless handle check: index in range, type snapshot current,
    /// owner is the calling process or nobody.
    pub fn validate_handle(&self, handle: GdiHandle, expected: Option<GdiObjectType>) -> bool {
        if handle.index() as usize >= self.entries.len() {
            return false;
        }
        if let Some(t) = expected {
            if handle.basetype() != t.type_index() {
                return false;
            }
        }
        let entry = self.entry(handle.index());
        if entry.type_info.load(Ordering::Acquire) << ENTRY_UPPER_SHIFT != handle.upper() {
            return false;
        }
        let holder = owner_pid(entry.owner.load(Ordering::Acquire));
        holder == 0 || holder == ps::current_process_id().0
    }

    /// Whether the calling process owns the handle. Stock objects are
    /// owned by nobody.
    pub fn owned_by_current_process(&self, handle: GdiHandle) -> bool {
        if handle.is_stock() || handle.index() as usize >= self.entries.len() {
            return false;
        }
        let entry = self.entry(handle.index());
        entry.kernel_data.load(Ordering::Relaxed) != 0
            && entry.type_info.load(Ordering::Relaxed) & ENTRY_BASETYPE_MASK != 0
            && owner_pid(entry.owner.load(Ordering::Acquire)) == ps::current_process_id().0
    }

    /// Store the user-mode shadow word for a live handle.
    pub fn set_user_data(&self, handle: GdiHandle, value: usize) -> bool {
        if handle.index() as usize >= self.entries.len() {
            return false;
        }
        let entry = self.entry(handle.index());
        if entry.type_info.load(Ordering::Acquire) << ENTRY_UPPER_SHIFT != handle.upper() {
            return false;
        }
        entry.user_data.store(value, Ordering::Release);
        true
    }

    /// Read the user-mode shadow word for a live handle.
    pub fn user_data(&self, handle: GdiHandle) -> Option<usize> {
        if handle.index() as usize >= self.entries.len() {
            return None;
        }
        let entry = self.entry(handle.index());
        if entry.type_info.load(Ordering::Acquire) << ENTRY_UPPER_SHIFT != handle.upper() {
            return None;
        }
        Some(entry.user_data.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------
    // Process teardown
    // ------------------------------------------------------------------

    /// Free every handle the process still owns.
    ///
    /// Types that reference other types go first (a DC selects brushes
    /// and surfaces), so teardown never leaves a dependent object
    /// pointing at a freed one.
    pub fn cleanup_for_process(&self, process: ProcessId) -> bool {
        debug!("starting gdi cleanup for process {:x}", process.0);
        let task = TaskIds {
            process,
            thread: ps::current_thread_id(),
        };

        const ORDER: [Option<GdiObjectType>; 4] = [
            Some(GdiObjectType::DeviceContext),
            Some(GdiObjectType::Brush),
            Some(GdiObjectType::Surface),
            None,
        ];

        'types: for filter in ORDER {
            if self.process_handle_count(process) == 0 {
                break;
            }
            let end = (self.first_unused.load(Ordering::Acquire) as usize).min(self.entries.len());
            for index in RESERVE_ENTRIES_COUNT as usize..end {
                let entry = &self.entries[index];
                // ignore the lock bit
                if owner_pid(entry.owner.load(Ordering::Acquire)) != process.0 {
                    continue;
                }
                let e_type = entry.type_info.load(Ordering::Acquire);
                let base_type = e_type & ENTRY_BASETYPE_MASK;
                if base_type == 0 {
                    continue;
                }
                if let Some(t) = filter {
                    if base_type != t.type_index() {
                        continue;
                    }
                }
                let handle = GdiHandle::compose(index as u32, e_type);
                if !self.free_by_handle_for(handle, None, true, task) {
                    warn!("failed to delete object {:08x} during process cleanup", handle.0);
                }
                if self.process_handle_count(process) == 0 {
                    continue 'types;
                }
            }
        }

        if cfg!(debug_assertions) {
            self.integrity_check();
        }

        let leaked = self.process_handle_count(process);
        if leaked > 0 {
            warn!("process {:x} leaking {} gdi handles", process.0, leaked);
        }
        debug!("completed gdi cleanup for process {:x}", process.0);
        leaked == 0
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Walk the free list and verify its structure: every slot on it has
    /// a clear base type and links to a valid lower-frontier index.
    pub fn integrity_check(&self) -> bool {
        let first_unused = self.first_unused.load(Ordering::Acquire);
        let mut ok = true;
        let mut seen = 0usize;
        let mut index = self.first_free.load(Ordering::Acquire);
        while index != 0 {
            if index >= first_unused || index as usize >= self.entries.len() {
                warn!("free list index {} out of range", index);
                ok = false;
                break;
            }
            let entry = self.entry(index);
            if entry.type_info.load(Ordering::Relaxed) & ENTRY_BASETYPE_MASK != 0 {
                warn!("free slot {} still has a live base type", index);
                ok = false;
                break;
            }
            seen += 1;
            if seen > self.entries.len() {
                warn!("free list cycle detected");
                ok = false;
                break;
            }
            index = entry.kernel_data.load(Ordering::Relaxed) as u32;
        }
        ok
    }

    /// Live-object counters per audited type.
    pub fn stats(&self) -> GdiTableStats {
        GdiTableStats {
            dc_count: self.object_counts[GdiObjectType::DeviceContext.type_index() as usize]
                .load(Ordering::Relaxed),
            surface_count: self.object_counts[GdiObjectType::Surface.type_index() as usize]
                .load(Ordering::Relaxed),
            palette_count: self.object_counts[GdiObjectType::Palette.type_index() as usize]
                .load(Ordering::Relaxed),
            brush_count: self.object_counts[GdiObjectType::Brush.type_index() as usize]
                .load(Ordering::Relaxed),
            total_handles: self.handle_counts.lock().values().sum(),
        }
    }

    /// How many times the cleanup routine for `object_type` has run.
    pub fn cleanup_run_count(&self, object_type: GdiObjectType) -> u32 {
        self.cleanup_runs[object_type.type_index() as usize].load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn cleanup_order(&self) -> Vec<u32> {
        self.cleanup_trace.lock().clone()
    }
}

impl Drop for GdiHandleTable {
    fn drop(&mut self) {
        for index in 0..self.entries.len() {
            let e_type = self.entries[index].type_info.load(Ordering::Relaxed);
            let base_type = e_type & ENTRY_BASETYPE_MASK;
            if base_type == 0 {
                continue;
            }
            let kernel_data = self.entries[index].kernel_data.load(Ordering::Relaxed);
            if kernel_data == 0 {
                continue;
            }
            warn!("gdi object in slot {} still live at table teardown", index);
            let info = &OBJ_TYPE_INFO[base_type as usize];
            unsafe { dealloc(kernel_data as *mut u8, body_layout(info.body_size)) };
        }
        for (base_type, cache) in self.lookasides.iter().enumerate() {
            let info = &OBJ_TYPE_INFO[base_type];
            for raw in cache.lock().drain(..) {
                unsafe { dealloc(raw as *mut u8, body_layout(info.body_size)) };
            }
        }
    }
}

fn lock_error_debug_output(handle: GdiHandle, entry_type: u32, function: &str) {
    if entry_type & ENTRY_BASETYPE_MASK == 0 {
        warn!(
            "{}: attempt to use object {:08x} that is deleted",
            function, handle.0
        );
    } else if (entry_type & ENTRY_REUSE_MASK) >> 8 != handle.reuse_count() {
        warn!(
            "{}: attempt to use object {:08x}, wrong reuse counter (handle {:x}, entry {:x})",
            function,
            handle.0,
            handle.reuse_count(),
            (entry_type & ENTRY_REUSE_MASK) >> 8
        );
    } else if entry_type & ENTRY_BASETYPE_MASK != handle.basetype() {
        warn!(
            "{}: attempt to use object {:08x}, type mismatch (handle {:x}, entry {:x})",
            function,
            handle.0,
            handle.basetype(),
            entry_type & ENTRY_BASETYPE_MASK
        );
    } else {
        warn!(
            "{}: attempt to use object {:08x}, something went wrong, type_info {:08x}",
            function, handle.0, entry_type
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdi::object::{Brush, DeviceContext};
    use crate::gdi::GDI_HANDLE_COUNT;
    use crate::ps::testing;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};

    fn setup() -> GdiHandleTable {
        testing::install();
        GdiHandleTable::new(GDI_HANDLE_COUNT)
    }

    fn alloc_handle(table: &GdiHandleTable, object_type: GdiObjectType) -> GdiHandle {
        let object = table.alloc_object_with_handle(object_type).expect("alloc");
        let handle = object.handle();
        table.unlock_object(object);
        handle
    }

    #[test]
    fn handle_lifecycle() {
        let table = setup();
        testing::set_current_pid(0x40);

        let object = table
            .alloc_object_with_handle(GdiObjectType::Brush)
            .expect("alloc");
        let handle = object.handle();
        assert_eq!(object.exclusive_lock_depth(), 1);
        assert!(table.validate_handle(handle, Some(GdiObjectType::Brush)));
        assert!(table.owned_by_current_process(handle));
        assert_eq!(table.process_handle_count(ProcessId(0x40)), 1);
        assert_eq!(table.stats().brush_count, 1);

        let locked = table
            .lock_object(handle, Some(GdiObjectType::Brush))
            .expect("lock");
        assert_eq!(locked.exclusive_lock_depth(), 2);
        table.unlock_object(locked);
        table.unlock_object(locked);
        assert_eq!(locked.exclusive_lock_depth(), 0);

        assert!(table.free_by_handle(handle, Some(GdiObjectType::Brush), false));
        assert_eq!(table.cleanup_run_count(GdiObjectType::Brush), 1);
        assert!(!table.validate_handle(handle, Some(GdiObjectType::Brush)));
        assert_eq!(table.process_handle_count(ProcessId(0x40)), 0);
        assert_eq!(table.stats().brush_count, 0);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let table = setup();
        let stale = alloc_handle(&table, GdiObjectType::Brush);
        assert!(table.free_by_handle(stale, None, false));

        // The freed slot is at the top of the free stack, so the next
        // allocation reuses it with a bumped reuse counter.
        let fresh = alloc_handle(&table, GdiObjectType::Brush);
        assert_eq!(fresh.index(), stale.index());
        assert_ne!(fresh, stale);
        assert_eq!(
            fresh.reuse_count(),
            (stale.reuse_count() + 1) & 0xFF,
        );

        assert!(!table.validate_handle(stale, None));
        assert!(!table.free_by_handle(stale, None, true));
        assert!(table.validate_handle(fresh, Some(GdiObjectType::Brush)));
        assert!(table.free_by_handle(fresh, None, false));
    }

    #[test]
    fn wrong_type_lock_fails() {
        let table = setup();
        let handle = alloc_handle(&table, GdiObjectType::Brush);
        assert!(table.lock_object(handle, Some(GdiObjectType::DeviceContext)).is_none());
        assert!(table.share_lock_object(handle, Some(GdiObjectType::DeviceContext)).is_none());
        assert!(!table.validate_handle(handle, Some(GdiObjectType::Surface)));
        assert!(table.free_by_handle(handle, None, false));
    }

    #[test]
    fn exhaustion_returns_null_and_reuses_freed_slots() {
        testing::install();
        let table = GdiHandleTable::new(RESERVE_ENTRIES_COUNT as usize + 2);
        let first = alloc_handle(&table, GdiObjectType::Palette);
        let second = alloc_handle(&table, GdiObjectType::Palette);
        assert!(table.alloc_object_with_handle(GdiObjectType::Palette).is_none());
        assert_eq!(table.stats().palette_count, 2);

        assert!(table.free_by_handle(first, None, false));
        let third = alloc_handle(&table, GdiObjectType::Palette);
        assert_eq!(third.index(), first.index());
        assert!(table.free_by_handle(second, None, false));
        assert!(table.free_by_handle(third, None, false));
        assert_eq!(table.stats().palette_count, 0);
        assert!(table.integrity_check());
    }

    #[test]
    fn shared_while_freed_defers_destruction() {
        let table = Arc::new(setup());
        testing::set_current_pid(0x50);
        let object = table
            .alloc_object_with_handle(GdiObjectType::Brush)
            .expect("alloc");
        let handle = object.handle();

        let share_taken = Arc::new(Barrier::new(2));
        let free_attempted = Arc::new(Barrier::new(2));
        let worker = {
            let table = Arc::clone(&table);
            let share_taken = Arc::clone(&share_taken);
            let free_attempted = Arc::clone(&free_attempted);
            std::thread::spawn(move || {
                testing::install();
                testing::set_current_pid(0x50);
                let shared = table
                    .share_lock_object(handle, Some(GdiObjectType::Brush))
                    .expect("share lock");
                share_taken.wait();
                free_attempted.wait();
                // the object is flagged ready-to-die; this unshare kills it
                assert_eq!(table.share_unlock(shared), 0);
            })
        };

        share_taken.wait();
        assert!(!table.free_by_handle(handle, Some(GdiObjectType::Brush), false));
        free_attempted.wait();
        worker.join().unwrap();

        assert!(!table.validate_handle(handle, None));
        assert_eq!(table.cleanup_run_count(GdiObjectType::Brush), 1);
        assert_eq!(table.process_handle_count(ProcessId(0x50)), 0);
        assert_eq!(table.stats().brush_count, 0);
    }

    #[test]
    fn exclusive_lock_blocks_other_threads() {
        let table = Arc::new(setup());
        testing::set_current_pid(0x40);
        let handle = alloc_handle(&table, GdiObjectType::Palette);

        let locked = Arc::new(AtomicBool::new(false));
        let holder = {
            let table = Arc::clone(&table);
            let locked = Arc::clone(&locked);
            std::thread::spawn(move || {
                testing::install();
                testing::set_current_pid(0x40);
                let object = table.lock_object(handle, None).expect("lock");
                locked.store(true, Ordering::Release);
                std::thread::sleep(std::time::Duration::from_millis(20));
                table.unlock_object(object);
            })
        };

        while !locked.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        // Spins until the holder releases, then succeeds.
        let object = table.lock_object(handle, None).expect("lock after wait");
        assert_eq!(object.exclusive_lock_depth(), 1);
        table.unlock_object(object);
        holder.join().unwrap();
        assert!(table.free_by_handle(handle, None, false));
    }

    #[test]
    fn convert_to_stock_is_idempotent_and_globalizes() {
        let table = setup();
        testing::set_current_pid(0x40);
        let mut handle = alloc_handle(&table, GdiObjectType::Brush);
        let plain = handle;

        assert!(table.convert_to_stock(&mut handle));
        assert!(handle.is_stock());
        assert_eq!(handle.index(), plain.index());
        assert_eq!(table.process_handle_count(ProcessId(0x40)), 0);
        assert!(!table.owned_by_current_process(handle));
        // validation still passes: the stock bit is in both the handle
        // and the slot snapshot, and global owners match any process
        assert!(table.validate_handle(handle, Some(GdiObjectType::Brush)));

        // converting again is a no-op
        assert!(table.convert_to_stock(&mut handle));
        assert!(handle.is_stock());
    }

    #[test]
    #[should_panic(expected = "bugcheck")]
    fn freeing_stock_objects_bug_checks() {
        let table = setup();
        let mut handle = alloc_handle(&table, GdiObjectType::Brush);
        assert!(table.convert_to_stock(&mut handle));
        table.free_by_handle(handle, None, true);
    }

    #[test]
    #[should_panic(expected = "bugcheck")]
    fn loud_double_free_bug_checks() {
        let table = setup();
        let handle = alloc_handle(&table, GdiObjectType::Palette);
        assert!(table.free_by_handle(handle, None, false));
        table.free_by_handle(handle, None, false);
    }

    #[test]
    fn ownership_transfer_moves_charges() {
        let table = setup();
        testing::set_current_pid(0x60);
        let handle = alloc_handle(&table, GdiObjectType::Surface);
        assert_eq!(table.process_handle_count(ProcessId(0x60)), 1);

        assert!(table.set_ownership(handle, Some(ProcessId(0x61))));
        assert_eq!(table.process_handle_count(ProcessId(0x60)), 0);
        assert_eq!(table.process_handle_count(ProcessId(0x61)), 1);
        // no longer ours to see or free
        assert!(!table.validate_handle(handle, None));
        assert!(!table.free_by_handle(handle, None, true));

        testing::set_current_pid(0x61);
        assert!(table.validate_handle(handle, None));
        assert!(table.free_by_handle(handle, None, false));
        assert_eq!(table.process_handle_count(ProcessId(0x61)), 0);
    }

    #[test]
    fn copy_ownership_follows_the_source() {
        let table = setup();
        testing::set_current_pid(0x70);
        let from = alloc_handle(&table, GdiObjectType::Brush);
        let to = alloc_handle(&table, GdiObjectType::Brush);

        assert!(table.set_ownership(from, Some(ProcessId(0x71))));
        assert!(table.copy_ownership(from, to));
        assert_eq!(table.process_handle_count(ProcessId(0x70)), 0);
        assert_eq!(table.process_handle_count(ProcessId(0x71)), 2);

        testing::set_current_pid(0x71);
        assert!(table.free_by_handle(from, None, false));
        assert!(table.free_by_handle(to, None, false));
    }

    #[test]
    fn user_data_shadow_round_trips() {
        let table = setup();
        let handle = alloc_handle(&table, GdiObjectType::Palette);
        assert_eq!(table.user_data(handle), Some(0));
        assert!(table.set_user_data(handle, 0xBEEF));
        assert_eq!(table.user_data(handle), Some(0xBEEF));
        assert!(table.free_by_handle(handle, None, false));
        // the shadow is cleared when the slot is retired
        assert_eq!(table.user_data(handle), None);
    }

    #[test]
    fn process_cleanup_frees_dcs_before_their_referents() {
        let table = setup();
        testing::set_current_pid(0x80);

        let brush = alloc_handle(&table, GdiObjectType::Brush);
        let surface = alloc_handle(&table, GdiObjectType::Surface);

        let dc_a = table
            .alloc_object_with_handle(GdiObjectType::DeviceContext)
            .expect("dc a");
        let dc_a_handle = dc_a.handle();
        unsafe { (*(dc_a as *const BaseObject as *mut DeviceContext)).brush = brush };
        table.unlock_object(dc_a);

        let dc_b = table
            .alloc_object_with_handle(GdiObjectType::DeviceContext)
            .expect("dc b");
        unsafe { (*(dc_b as *const BaseObject as *mut DeviceContext)).surface = surface };
        table.unlock_object(dc_b);

        assert_eq!(table.process_handle_count(ProcessId(0x80)), 4);
        assert!(table.cleanup_for_process(ProcessId(0x80)));
        assert_eq!(table.process_handle_count(ProcessId(0x80)), 0);
        assert!(!table.validate_handle(dc_a_handle, None));
        assert!(table.integrity_check());

        // Both DCs died before the brush and the surface they reference.
        let order = table.cleanup_order();
        let dc_type = GdiObjectType::DeviceContext.type_index();
        let last_dc = order.iter().rposition(|&t| t == dc_type).unwrap();
        let first_ref = order
            .iter()
            .position(|&t| t != dc_type)
            .unwrap();
        assert!(last_dc < first_ref);
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn reserved_entries_are_never_handed_out() {
        let table = setup();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let handle = alloc_handle(&table, GdiObjectType::Palette);
            assert!(handle.index() >= RESERVE_ENTRIES_COUNT);
            handles.push(handle);
        }
        for handle in handles {
            assert!(table.free_by_handle(handle, None, false));
        }
        assert!(table.integrity_check());
    }

    #[test]
    fn lookaside_recycles_bodies() {
        let table = setup();
        // Brushes use the lookaside: free then allocate again and the
        // body comes back zeroed from the cache.
        let object = table
            .alloc_object_with_handle(GdiObjectType::Brush)
            .expect("alloc");
        unsafe { (*(object as *const BaseObject as *mut Brush)).color = 0x00FF_00FF };
        let first_body = object as *const BaseObject as usize;
        let handle = object.handle();
        table.unlock_object(object);
        assert!(table.free_by_handle(handle, None, false));

        let object = table
            .alloc_object_with_handle(GdiObjectType::Brush)
            .expect("realloc");
        let second_body = object as *const BaseObject as usize;
        assert_eq!(first_body, second_body);
        let brush = unsafe { &*(object as *const BaseObject as *const Brush) };
        assert_eq!(brush.color, 0);
        let handle = object.handle();
        table.unlock_object(object);
        assert!(table.free_by_handle(handle, None, false));
    }

    #[test]
    fn concurrent_alloc_free_is_consistent() {
        let table = Arc::new(setup());
        let threads: Vec<_> = (0..4)
            .map(|worker| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    testing::install();
                    testing::set_current_pid(0x90 + worker);
                    for _ in 0..200 {
                        let object = table
                            .alloc_object_with_handle(GdiObjectType::Brush)
                            .expect("alloc");
                        let handle = object.handle();
                        table.unlock_object(object);
                        assert!(table.validate_handle(handle, Some(GdiObjectType::Brush)));
                        assert!(table.free_by_handle(handle, Some(GdiObjectType::Brush), false));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(table.stats().brush_count, 0);
        assert_eq!(table.stats().total_handles, 0);
        assert!(table.integrity_check());
    }
}
