//! Kernel executive support
//!
//! - `bugcheck`: unrecoverable-error handling (STOP codes)
//! - `SpinWait`: bounded back-off for slot-lock contention loops

pub mod bugcheck;

pub use bugcheck::bugcheck_impl;

/// Busy-wait iterations per back-off step in freestanding builds.
#[cfg(not(test))]
const SPINS_PER_DELAY: u32 = 64;

/// Back-off steps before a contention loop is reported as making no
/// progress.
const PROGRESS_WARN_THRESHOLD: u32 = 1 << 20;

/// Back-off helper for contention loops.
///
/// Every loop that spins on another actor's slot lock carries one of
/// these. A loop that keeps waiting past the progress threshold is
/// reported once; waiting itself never fails.
pub struct SpinWait {
    waits: u32,
}

impl SpinWait {
    pub const fn new() -> Self {
        Self { waits: 0 }
    }

    /// Wait a short time before re-examining contended state.
    pub fn delay(&mut self) {
        self.waits = self.waits.wrapping_add(1);
        if self.waits == PROGRESS_WARN_THRESHOLD {
            log::warn!("contention loop made no progress after {} waits", self.waits);
        }

        #[cfg(not(test))]
        for _ in 0..SPINS_PER_DELAY {
            core::hint::spin_loop();
        }

        #[cfg(test)]
        std::thread::yield_now();
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new()
    }
}
