//! NT status codes
//!
//! The subset of NTSTATUS values the cache manager and the GDI object
//! manager actually produce. Invariant violations never surface as a
//! status; they go through `bugcheck!` instead.

/// NT status code
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtStatus {
    Success = 0,
    /// No VACB covered the requested offset
    Unsuccessful = 0xC0000001,
    InvalidParameter = 0xC000000D,
    EndOfFile = 0xC0000011,
    InsufficientResources = 0xC000009A,
    MediaWriteProtected = 0xC00000A2,
}

impl NtStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }
}
