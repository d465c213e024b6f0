//! Kernel core subsystems
//!
//! Host-testable implementation of the two hardest kernel subsystems:
//!
//! - **Cache Manager (cc)**: file-backed virtual address cache. Files are
//!   cached through fixed-size mapping windows (VACBs), with a global LRU,
//!   a dirty-VACB FIFO drained by the lazy writer, and memory-pressure
//!   trimming.
//! - **GDI Object Manager (gdi)**: typed object handle table. Small
//!   polymorphic object bodies are reachable through opaque 32-bit handles,
//!   with per-process ownership accounting, a lock-free slot free list and
//!   a reuse counter that rejects stale handles.
//!
//! Both cores share the same discipline: fine-grained atomic state
//! transitions on fixed-slot structures, reference counts coordinated with
//! explicit list membership, and lock-hopping between a coarse structural
//! lock and per-entry fine locks.
//!
//! # Architecture
//!
//! Supporting modules mirror the kernel's subsystem layout:
//!
//! - `ke`: bug check and contention back-off primitives
//! - `ps`: process/thread identity
//! - `mm`: virtual view provider (mapping creation, page-out)
//! - `io`: file objects and section pointers
//!
//! The cache consumes its virtual memory and backing-store I/O through
//! traits (`mm::ViewProvider`, `cc::CacheCallbacks`); the object manager
//! consumes task identity through `ps`. Tests instantiate their own
//! `ViewCache` / `GdiHandleTable`; there is no process-wide state besides
//! the task-identity hook.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cc;
pub mod gdi;
pub mod io;
pub mod ke;
pub mod mm;
pub mod ps;
pub mod status;

pub use status::NtStatus;
