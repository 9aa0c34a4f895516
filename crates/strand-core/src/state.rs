//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, not yet started
    Created = 0,

    /// Ready to run, in the ready queue
    Ready = 1,

    /// Currently executing
    Running = 2,

    /// Parked on a wait set (channel, fd, timer, reap)
    Blocked = 3,

    /// Entry function returned; stack retained until the owner cancels
    Finished = 4,

    /// Marked for cancellation, still unwinding toward its entry return
    Canceling = 5,
}

impl FiberState {
    /// Check if this state allows the fiber to be scheduled
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has returned from its entry function
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, FiberState::Finished)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Created,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Blocked,
            4 => FiberState::Finished,
            5 => FiberState::Canceling,
            _ => FiberState::Created, // Default for invalid values
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Created => write!(f, "created"),
            FiberState::Ready => write!(f, "ready"),
            FiberState::Running => write!(f, "running"),
            FiberState::Blocked => write!(f, "blocked"),
            FiberState::Finished => write!(f, "finished"),
            FiberState::Canceling => write!(f, "canceling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(!FiberState::Blocked.is_runnable());

        assert!(FiberState::Finished.is_finished());
        assert!(!FiberState::Canceling.is_finished());
    }

    #[test]
    fn test_state_roundtrip() {
        for raw in 0u8..=5 {
            let s = FiberState::from(raw);
            assert_eq!(u8::from(s), raw);
        }
        // Out-of-range folds to Created
        assert_eq!(FiberState::from(200), FiberState::Created);
    }
}
