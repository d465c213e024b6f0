//! GDI Object Manager
//!
//! Kernel-mode object management for the graphics engine. Graphics
//! objects use a handle-based system:
//!
//! - Object bodies live behind a fixed-size handle table; a handle is an
//!   opaque 32-bit value carrying the slot index in its lower half and a
//!   snapshot of the slot's type word (base type, stock flag, reuse
//!   counter) in its upper half
//! - Free slots form a lock-free singly linked stack threaded through
//!   the slot's body-pointer word
//! - Every slot mutation is a two-phase atomic sequence: the low bit of
//!   the owner word is a per-slot spinlock, the rest identifies the
//!   owning process (zero for global objects)
//! - A reuse counter in the slot's type word increments on every free,
//!   so handles from a retired generation fail validation
//!
//! # Components
//!
//! - `handle`: handle encoding and the object type tags
//! - `object`: the common object header, concrete bodies, the type table
//!   and the per-type lookaside caches
//! - `table`: the handle table and every object manager operation

pub mod handle;
pub mod object;
pub mod table;

pub use handle::{GdiHandle, GdiObjectType};
pub use object::{BaseFlags, BaseObject, Brush, DeviceContext, Palette, Surface};
pub use table::{GdiHandleTable, GdiTableStats};

/// Default number of handle table entries.
pub const GDI_HANDLE_COUNT: usize = 16384;

/// The first entries of the table are never used.
pub const RESERVE_ENTRIES_COUNT: u32 = 10;

/// Per-process handle cap.
pub const GDI_HANDLE_QUOTA: u32 = 10_000;

/// Allocate a GDI handle table with `entry_count` slots.
pub fn alloc_handle_table(entry_count: usize) -> GdiHandleTable {
    GdiHandleTable::new(entry_count)
}
