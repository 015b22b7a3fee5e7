//! Operational result codes.
//!
//! Message result fields carry the raw value (0 is success). Everything
//! recoverable in the core returns a [`KResult`]; invariant violations are
//! not represented here at all.

use core::fmt;

pub const EOK: i32 = 0;
pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EINTR: i32 = 4;
pub const E2BIG: i32 = 7;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const EAGAIN: i32 = 35;
pub const EWOULDBLOCK: i32 = EAGAIN;
pub const ENOTSUP: i32 = 45;
pub const ENOBUFS: i32 = 55;
pub const ENOTCONN: i32 = 57;
pub const ENOSYS: i32 = 78;
pub const ECANCELED: i32 = 85;
/// The operation was queued and will complete later.
pub const EASYNC: i32 = 99;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    NotPermitted = EPERM,
    NoEntry = ENOENT,
    Interrupted = EINTR,
    TooBig = E2BIG,
    AccessDenied = EACCES,
    Exists = EEXIST,
    Invalid = EINVAL,
    WouldBlock = EAGAIN,
    NotSupported = ENOTSUP,
    NoBuffers = ENOBUFS,
    NotConnected = ENOTCONN,
    NoSys = ENOSYS,
    Canceled = ECANCELED,
    Async = EASYNC,
}

impl Errno {
    /// Map a raw result code back to an error. `0` and unknown codes map to
    /// `None` and `Some(Invalid)` respectively.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            EOK => None,
            EPERM => Some(Self::NotPermitted),
            ENOENT => Some(Self::NoEntry),
            EINTR => Some(Self::Interrupted),
            E2BIG => Some(Self::TooBig),
            EACCES => Some(Self::AccessDenied),
            EEXIST => Some(Self::Exists),
            EAGAIN => Some(Self::WouldBlock),
            ENOTSUP => Some(Self::NotSupported),
            ENOBUFS => Some(Self::NoBuffers),
            ENOTCONN => Some(Self::NotConnected),
            ENOSYS => Some(Self::NoSys),
            ECANCELED => Some(Self::Canceled),
            EASYNC => Some(Self::Async),
            _ => Some(Self::Invalid),
        }
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Negative form used at the syscall return boundary.
    #[inline]
    pub const fn to_errno(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Turn a raw result code into a `KResult`.
    #[inline]
    pub const fn check(raw: i32) -> KResult {
        match Self::from_raw(raw) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotPermitted => "operation not permitted",
            Self::NoEntry => "no such entry",
            Self::Interrupted => "interrupted",
            Self::TooBig => "too many outstanding requests",
            Self::AccessDenied => "access denied",
            Self::Exists => "already exists",
            Self::Invalid => "invalid argument",
            Self::WouldBlock => "operation would block",
            Self::NotSupported => "operation not supported",
            Self::NoBuffers => "no buffer space available",
            Self::NotConnected => "not connected",
            Self::NoSys => "function not implemented",
            Self::Canceled => "operation canceled",
            Self::Async => "operation queued",
        };
        write!(f, "{} ({})", text, self.as_raw())
    }
}

pub type KResult<T = ()> = Result<T, Errno>;
