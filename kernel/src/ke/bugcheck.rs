//! Bug check (STOP code) handling
//!
//! A bug check is raised when a subsystem detects an unrecoverable
//! internal inconsistency: a caller bug, never an environmental error.
//! In kernel context this halts the machine; in library context it logs
//! the STOP code and panics.

/// STOP codes raised by the subsystems in this crate.
pub mod codes {
    /// CACHE_MANAGER (0x34)
    ///
    /// Cache manager invariant violated: misaligned view request,
    /// mark-dirty of an offset no VACB covers, VACB freed with
    /// outstanding state.
    pub const CACHE_MANAGER: u32 = 0x0000_0034;

    /// GDI_OBJECT_MANAGER
    ///
    /// Handle table invariant violated: free of a stock object,
    /// double free or invalid-type free without the silent flag,
    /// allocation from a reserved type table entry.
    pub const GDI_OBJECT_MANAGER: u32 = 0x0000_00D2;
}

/// Raise a bug check. Never returns.
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck_impl($code, core::format_args!(""))
    };
    ($code:expr, $($arg:tt)*) => {
        $crate::ke::bugcheck_impl($code, core::format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn bugcheck_impl(code: u32, args: core::fmt::Arguments<'_>) -> ! {
    log::error!("*** STOP: 0x{:08X} {}", code, args);
    panic!("bugcheck 0x{:08X}: {}", code, args);
}
