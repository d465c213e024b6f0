//! Lazy writer scheduling and write throttling
//!
//! The lazy writer thread itself lives outside the cache; the cache only
//! decides *when* a scan is wanted and *how much* a pass should write.
//! Marking the first window dirty while the writer is idle schedules a
//! scan through the registered hook; each pass flushes a fraction of the
//! dirty total so data ages out within a bounded number of passes.
//!
//! Foreground writers are throttled against the dirty page threshold:
//! over it, `can_i_write` refuses and (for waiters) parks a deferred
//! write entry that is re-admitted once a pass brings the total back
//! down.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::view::ViewCache;

/// Divisor applied to the dirty total per pass: dirty data is fully
/// written back within this many passes.
pub const LAZY_WRITER_MAX_AGE_TARGET: u32 = 8;

/// Hook invoked to schedule a lazy writer scan.
pub trait LazyWriterHook: Send + Sync {
    fn schedule_scan(&self, fast: bool);
}

/// One parked foreground write.
#[derive(Debug, Clone, Copy)]
pub struct DeferredWrite {
    pub bytes_to_write: u32,
    pub retrying: bool,
}

pub(crate) struct LazySched {
    pub scan_active: bool,
    pub hook: Option<Arc<dyn LazyWriterHook>>,
}

/// Lazy writer state hanging off the view cache.
pub(crate) struct LazyWriteControl {
    /// Master scheduling lock.
    master: Mutex<LazySched>,
    pub(crate) dirty_page_threshold: AtomicU32,
    /// Deferred write queue, its own lock.
    deferred: Mutex<VecDeque<DeferredWrite>>,
}

impl LazyWriteControl {
    pub fn new() -> Self {
        Self {
            master: Mutex::new(LazySched {
                scan_active: false,
                hook: None,
            }),
            dirty_page_threshold: AtomicU32::new(0),
            deferred: Mutex::new(VecDeque::new()),
        }
    }
}

impl ViewCache {
    /// Register the scan hook the host's lazy writer thread listens on.
    pub fn set_lazy_writer_hook(&self, hook: Arc<dyn LazyWriterHook>) {
        self.lazy.master.lock().hook = Some(hook);
    }

    /// Pages of dirty data above which foreground writes are throttled.
    /// Zero disables throttling.
    pub fn set_dirty_page_threshold(&self, pages: u32) {
        self.lazy.dirty_page_threshold.store(pages, Ordering::Release);
    }

    pub fn dirty_page_threshold(&self) -> u32 {
        self.lazy.dirty_page_threshold.load(Ordering::Acquire)
    }

    /// Whether a scan is scheduled or running.
    pub fn lazy_writer_active(&self) -> bool {
        self.lazy.master.lock().scan_active
    }

    /// Schedule a scan if the writer is idle. Called on the transition
    /// to a nonzero dirty total.
    pub(crate) fn kick_lazy_writer(&self) {
        let hook = {
            let mut sched = self.lazy.master.lock();
            if sched.scan_active {
                None
            } else {
                sched.scan_active = true;
                sched.hook.clone()
            }
        };
        if let Some(hook) = hook {
            hook.schedule_scan(false);
        }
    }

    /// One lazy writer pass: write back a fraction of the dirty total,
    /// re-admit deferred writes, then either go idle or re-arm the scan.
    /// Returns the pages written.
    pub fn lazy_write_pass(&self) -> u32 {
        let dirty = self.total_dirty_pages();
        if dirty == 0 && self.lazy.deferred.lock().is_empty() {
            self.lazy.master.lock().scan_active = false;
            return 0;
        }

        let mut target = dirty;
        if target > LAZY_WRITER_MAX_AGE_TARGET {
            target /= LAZY_WRITER_MAX_AGE_TARGET;
        }
        let written = self.flush_dirty(target.max(1), true);

        // Deferred writes are not drained here; the host pulls them with
        // `post_deferred_writes` and re-issues them itself. A non-empty
        // queue keeps the scan armed.
        let rearm = {
            let mut sched = self.lazy.master.lock();
            if self.total_dirty_pages() == 0 && self.lazy.deferred.lock().is_empty() {
                sched.scan_active = false;
                None
            } else {
                sched.hook.clone()
            }
        };
        if let Some(hook) = rearm {
            hook.schedule_scan(false);
        }
        written
    }

    /// Whether a foreground write of `bytes_to_write` may proceed. Over
    /// the threshold the write is refused; with `wait` set it is parked
    /// on the deferred queue for later re-admission.
    pub fn can_i_write(&self, bytes_to_write: u32, wait: bool, retrying: bool) -> bool {
        let threshold = self.dirty_page_threshold();
        if threshold == 0 || self.total_dirty_pages() < threshold {
            return true;
        }
        if wait {
            self.defer_write(bytes_to_write, retrying);
        }
        false
    }

    /// Park a refused write. Retries queue at the front so the oldest
    /// waiter goes first.
    pub fn defer_write(&self, bytes_to_write: u32, retrying: bool) {
        {
            let mut queue = self.lazy.deferred.lock();
            let entry = DeferredWrite {
                bytes_to_write,
                retrying,
            };
            if retrying {
                queue.push_front(entry);
            } else {
                queue.push_back(entry);
            }
        }
        self.kick_lazy_writer();
    }

    /// Deferred writes currently parked.
    pub fn deferred_write_count(&self) -> usize {
        self.lazy.deferred.lock().len()
    }

    /// Pop every deferred write that now fits under the threshold. The
    /// host re-issues the returned writes.
    pub fn post_deferred_writes(&self) -> Vec<DeferredWrite> {
        let threshold = self.dirty_page_threshold();
        let mut admitted = Vec::new();
        let mut queue = self.lazy.deferred.lock();
        while let Some(entry) = queue.front() {
            if threshold != 0 && self.total_dirty_pages() >= threshold {
                break;
            }
            admitted.push(*entry);
            queue.pop_front();
        }
        admitted
    }
}
