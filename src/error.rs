//! Error taxonomy: synchronous submission errors versus asynchronous
//! transfer-completion errors are kept as two distinct types so a
//! completion code can never leak back out of a submit path — sync errors
//! return to the caller, async errors are delivered exactly once through
//! the transfer's callback.

use core::fmt;

/// Errors returned synchronously from submission and controller-management
/// paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    BadValue,
    NoMemory,
    NotAllowed,
    NoInit,
    Unsupported,
    Busy,
    NotFound,
    Timeout,
    IoError,
}

pub type KResult<T> = core::result::Result<T, KError>;

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KError::BadValue => "bad value",
            KError::NoMemory => "no memory",
            KError::NotAllowed => "not allowed",
            KError::NoInit => "controller not initialized",
            KError::Unsupported => "unsupported",
            KError::Busy => "busy",
            KError::NotFound => "not found",
            KError::Timeout => "timed out",
            KError::IoError => "I/O error",
        };
        f.write_str(s)
    }
}

/// Completion status delivered through a `Transfer`'s callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferError {
    #[default]
    Ok,
    Crc,
    Stalled,
    DataOverrun,
    DataUnderrun,
    FifoOverrun,
    FifoUnderrun,
    Babble,
    MultipleErrors,
    Canceled,
    TimedOut,
}

impl TransferError {
    pub fn is_ok(self) -> bool {
        matches!(self, TransferError::Ok)
    }
}
