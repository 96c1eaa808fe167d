//! Error types for the HD-Audio driver core
//!
//! Every fallible operation returns [`UhdaResult`]. Statuses produced by the
//! host kernel layer travel through unchanged as [`UhdaError::Host`].

use alloc::collections::TryReserveError;
use core::fmt;

/// Driver error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UhdaError {
    /// An allocation failed, either in the host or on the driver heap
    NoMemory,

    /// A bounded hardware wait ran past its ceiling
    Timeout,

    /// The hardware or the requested operation is not supported
    Unsupported,

    /// Status reported by the host kernel layer
    Host(i32),
}

impl fmt::Display for UhdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "Out of memory"),
            Self::Timeout => write!(f, "Hardware wait timed out"),
            Self::Unsupported => write!(f, "Operation not supported"),
            Self::Host(code) => write!(f, "Host kernel error {}", code),
        }
    }
}

impl From<TryReserveError> for UhdaError {
    fn from(_: TryReserveError) -> Self {
        Self::NoMemory
    }
}

/// Result type used throughout the driver
pub type UhdaResult<T> = Result<T, UhdaError>;
