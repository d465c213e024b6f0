//! GDI object bodies and the type table
//!
//! Every tracked body starts with a `BaseObject` header. The header is
//! all atomics: it is read and written while only the handle slot's
//! spinlock is held, by whichever thread is transitioning the object.
//!
//! The type table is compile-time: one row per base type index, carrying
//! the body size, pool tag, cleanup routine and whether freed bodies are
//! cached on a per-type lookaside list. Reserved rows are all zero and
//! must never be used to allocate.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::handle::GdiHandle;

bitflags! {
    /// Base object state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BaseFlags: u32 {
        /// A free was refused because the object was share locked; the
        /// last share unlock completes the destruction.
        const READY_TO_DIE = 0x0000_0001;
    }
}

/// Common header at the start of every tracked object body.
#[repr(C)]
pub struct BaseObject {
    /// Backreference to the handle, zero once the body is detached.
    pub(crate) handle: AtomicU32,
    /// Shared lock holders.
    pub(crate) share_count: AtomicU32,
    /// Exclusive lock depth, reentrant per thread.
    pub(crate) exclusive_lock: AtomicU32,
    /// Thread holding the exclusive lock.
    pub(crate) owning_tid: AtomicU64,
    /// `BaseFlags` bits.
    pub(crate) flags: AtomicU32,
}

impl BaseObject {
    pub fn handle(&self) -> GdiHandle {
        GdiHandle(self.handle.load(Ordering::Acquire))
    }

    pub fn share_count(&self) -> u32 {
        self.share_count.load(Ordering::Acquire)
    }

    pub fn exclusive_lock_depth(&self) -> u32 {
        self.exclusive_lock.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> BaseFlags {
        BaseFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
}

/// Device context.
#[repr(C)]
pub struct DeviceContext {
    pub base: BaseObject,
    pub dc_type: u32,
    pub surface: GdiHandle,
    pub brush: GdiHandle,
    pub origin_x: i32,
    pub origin_y: i32,
}

/// Bitmap surface.
#[repr(C)]
pub struct Surface {
    pub base: BaseObject,
    pub width: i32,
    pub height: i32,
    pub stride: u32,
    pub bits_per_pixel: u32,
}

/// Color palette.
#[repr(C)]
pub struct Palette {
    pub base: BaseObject,
    pub entry_count: u32,
}

/// Brush (covers pens and extended pens as well; they share the base
/// type).
#[repr(C)]
pub struct Brush {
    pub base: BaseObject,
    pub style: u32,
    pub color: u32,
    pub hatch: u32,
    pub pattern: GdiHandle,
}

/// Per-type cleanup routine, run after the handle is retired and before
/// the body is returned to its pool.
pub type CleanupProc = fn(*mut BaseObject) -> bool;

/// One row of the type table.
#[derive(Clone, Copy)]
pub struct ObjTypeInfo {
    pub use_lookaside: bool,
    pub body_size: usize,
    pub tag: u32,
    pub cleanup: Option<CleanupProc>,
}

/// Number of base object types.
pub const BASE_OBJTYPE_COUNT: usize = 32;

const fn tag(bytes: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*bytes)
}

const RESERVED: ObjTypeInfo = ObjTypeInfo {
    use_lookaside: false,
    body_size: 0,
    tag: 0,
    cleanup: None,
};

fn cleanup_dummy(_body: *mut BaseObject) -> bool {
    true
}

fn dc_cleanup(body: *mut BaseObject) -> bool {
    log::trace!("DC cleanup {:p}", body);
    true
}

fn surface_cleanup(body: *mut BaseObject) -> bool {
    log::trace!("SURFACE cleanup {:p}", body);
    true
}

fn brush_cleanup(body: *mut BaseObject) -> bool {
    log::trace!("BRUSH cleanup {:p}", body);
    true
}

/// The type table, indexed by base type.
pub(crate) static OBJ_TYPE_INFO: [ObjTypeInfo; BASE_OBJTYPE_COUNT] = [
    RESERVED, /* 00 reserved entry */
    ObjTypeInfo {
        use_lookaside: true,
        body_size: size_of::<DeviceContext>(),
        tag: tag(b"Gdc "),
        cleanup: Some(dc_cleanup),
    }, /* 01 DC */
    RESERVED, /* 02 reserved entry */
    RESERVED, /* 03 reserved entry */
    RESERVED, /* 04 reserved entry */
    ObjTypeInfo {
        use_lookaside: false,
        body_size: size_of::<Surface>(),
        tag: tag(b"Gsur"),
        cleanup: Some(surface_cleanup),
    }, /* 05 SURFACE */
    RESERVED, /* 06 reserved entry */
    RESERVED, /* 07 reserved entry */
    ObjTypeInfo {
        use_lookaside: false,
        body_size: size_of::<Palette>(),
        tag: tag(b"Gpal"),
        cleanup: Some(cleanup_dummy),
    }, /* 08 PAL */
    RESERVED, /* 09 ICMLCS */
    RESERVED, /* 0a LFONT */
    RESERVED, /* 0b RFONT */
    RESERVED, /* 0c PFE */
    RESERVED, /* 0d PFT */
    RESERVED, /* 0e ICMCXF */
    RESERVED, /* 0f SPRITE */
    ObjTypeInfo {
        use_lookaside: true,
        body_size: size_of::<Brush>(),
        tag: tag(b"Gbru"),
        cleanup: Some(brush_cleanup),
    }, /* 10 BRUSH, PEN, EXTPEN */
    RESERVED, /* 11 UMPD */
    RESERVED, /* 12 unused */
    RESERVED, /* 13 SPACE */
    RESERVED, /* 14 unused */
    RESERVED, /* 15 META */
    RESERVED, /* 16 EFSTATE */
    RESERVED, /* 17 BMFD */
    RESERVED, /* 18 VTFD */
    RESERVED, /* 19 TTFD */
    RESERVED, /* 1a RC */
    RESERVED, /* 1b TEMP */
    RESERVED, /* 1c DRVOBJ */
    RESERVED, /* 1d DCIOBJ */
    RESERVED, /* 1e SPOOL */
    RESERVED, /* 1f reserved entry */
];
