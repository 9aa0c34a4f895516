//! Error taxonomy for runtime operations
//!
//! Every blocking primitive reports its outcome through [`RtError`]. The
//! numeric errno values are preserved at the public boundary via
//! [`RtError::errno`] so callers porting from a C-style API keep their
//! error codes.

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

// POSIX errno values (Linux numbering), kept next to the enum so the
// mapping is auditable at a glance.
pub const ECANCELED: i32 = 125;
pub const ETIMEDOUT: i32 = 110;
pub const EINVAL: i32 = 22;
pub const ENOMEM: i32 = 12;
pub const EPIPE: i32 = 32;
pub const EEXIST: i32 = 17;
pub const EBADF: i32 = 9;

/// Errors surfaced by runtime operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtError {
    /// The owner asked this fiber to terminate; sticky once observed
    Canceled,

    /// Absolute deadline reached
    TimedOut,

    /// Structural argument violation (mismatched item size, bad handle)
    BadArg,

    /// Stack or buffer allocation failed
    Oom,

    /// Channel is done; the operation would block forever otherwise
    Pipe,

    /// Another fiber already holds this (fd, direction) slot
    Busy,

    /// The kernel rejected the file descriptor
    BadFd,
}

impl RtError {
    /// The POSIX errno equivalent of this error
    #[inline]
    pub const fn errno(self) -> i32 {
        match self {
            RtError::Canceled => ECANCELED,
            RtError::TimedOut => ETIMEDOUT,
            RtError::BadArg => EINVAL,
            RtError::Oom => ENOMEM,
            RtError::Pipe => EPIPE,
            RtError::Busy => EEXIST,
            RtError::BadFd => EBADF,
        }
    }

    /// Map an errno back to the taxonomy, if it is one of ours
    pub const fn from_errno(errno: i32) -> Option<RtError> {
        match errno {
            ECANCELED => Some(RtError::Canceled),
            ETIMEDOUT => Some(RtError::TimedOut),
            EINVAL => Some(RtError::BadArg),
            ENOMEM => Some(RtError::Oom),
            EPIPE => Some(RtError::Pipe),
            EEXIST => Some(RtError::Busy),
            EBADF => Some(RtError::BadFd),
            _ => None,
        }
    }
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::Canceled => write!(f, "operation canceled"),
            RtError::TimedOut => write!(f, "operation timed out"),
            RtError::BadArg => write!(f, "invalid argument"),
            RtError::Oom => write!(f, "out of memory"),
            RtError::Pipe => write!(f, "channel done"),
            RtError::Busy => write!(f, "fd already has a waiter"),
            RtError::BadFd => write!(f, "bad file descriptor"),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", RtError::Canceled), "operation canceled");
        assert_eq!(format!("{}", RtError::Pipe), "channel done");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RtError::Canceled.errno(), ECANCELED);
        assert_eq!(RtError::TimedOut.errno(), ETIMEDOUT);
        assert_eq!(RtError::BadArg.errno(), EINVAL);
        assert_eq!(RtError::Busy.errno(), EEXIST);
    }

    #[test]
    fn test_errno_roundtrip() {
        for e in [
            RtError::Canceled,
            RtError::TimedOut,
            RtError::BadArg,
            RtError::Oom,
            RtError::Pipe,
            RtError::Busy,
            RtError::BadFd,
        ] {
            assert_eq!(RtError::from_errno(e.errno()), Some(e));
        }
        assert_eq!(RtError::from_errno(0), None);
    }
}
