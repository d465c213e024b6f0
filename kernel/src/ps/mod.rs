//! Process and thread identity
//!
//! The object manager records which process owns a handle slot and which
//! thread holds an object's exclusive lock, but it does not schedule
//! anything itself. Whoever hosts these subsystems supplies the identity
//! of the running task through `set_current_task_provider`; until one is
//! installed, everything runs as the system process.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

/// The process that owns kernel-mode allocations.
pub const SYSTEM_PROCESS_ID: ProcessId = ProcessId(4);

/// Identity of the currently running task.
#[derive(Debug, Clone, Copy)]
pub struct TaskIds {
    pub process: ProcessId,
    pub thread: ThreadId,
}

/// Provider of the current task identity.
pub type TaskProvider = fn() -> TaskIds;

static TASK_PROVIDER: AtomicUsize = AtomicUsize::new(0);

/// Install the task identity provider.
pub fn set_current_task_provider(provider: TaskProvider) {
    TASK_PROVIDER.store(provider as usize, Ordering::Release);
}

/// Identity of the current task.
pub fn current_task() -> TaskIds {
    let raw = TASK_PROVIDER.load(Ordering::Acquire);
    if raw == 0 {
        TaskIds {
            process: SYSTEM_PROCESS_ID,
            thread: ThreadId(1),
        }
    } else {
        let provider: TaskProvider = unsafe { mem::transmute(raw) };
        provider()
    }
}

/// Id of the current process.
#[inline]
pub fn current_process_id() -> ProcessId {
    current_task().process
}

/// Id of the current thread.
#[inline]
pub fn current_thread_id() -> ThreadId {
    current_task().thread
}

#[cfg(test)]
pub(crate) mod testing {
    //! Task provider backed by std threads, for the concurrency tests.

    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::AtomicU64;

    std::thread_local! {
        static CURRENT_PID: Cell<u32> = const { Cell::new(0x40) };
        static CURRENT_TID: Cell<u64> = const { Cell::new(0) };
    }

    static NEXT_TID: AtomicU64 = AtomicU64::new(1);

    fn thread_tasks() -> TaskIds {
        let tid = CURRENT_TID.with(|c| {
            if c.get() == 0 {
                c.set(NEXT_TID.fetch_add(1, Ordering::Relaxed));
            }
            c.get()
        });
        TaskIds {
            process: ProcessId(CURRENT_PID.with(|c| c.get())),
            thread: ThreadId(tid),
        }
    }

    pub fn install() {
        set_current_task_provider(thread_tasks);
    }

    /// Run the calling thread as the given process from here on.
    pub fn set_current_pid(pid: u32) {
        CURRENT_PID.with(|c| c.set(pid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity_is_system() {
        // No provider installed in this process order-independent way is
        // not guaranteed, so only check the provider round trip.
        testing::install();
        testing::set_current_pid(0x77);
        assert_eq!(current_process_id(), ProcessId(0x77));
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
    }

    #[test]
    fn threads_get_distinct_ids() {
        testing::install();
        let here = current_thread_id();
        let there = std::thread::spawn(|| {
            testing::install();
            current_thread_id()
        })
        .join()
        .unwrap();
        assert_ne!(here, there);
    }
}
