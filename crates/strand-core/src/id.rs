//! Arena handles
//!
//! Fibers and channels are addressed by handles into runtime-owned
//! tables. A handle is an index plus the slot's generation at the time
//! it was issued; recycling a slot bumps the generation, so a handle
//! kept past its object's lifetime stops resolving instead of silently
//! aliasing the slot's next occupant.

use core::fmt;
use core::marker::PhantomData;

/// Marker for fiber handles
pub enum FiberTag {}

/// Marker for channel handles
pub enum ChanTag {}

/// Generation-tagged index into an arena
///
/// The marker type only prevents mixing fiber and channel handles; it
/// carries no data.
pub struct Handle<K> {
    idx: u32,
    gen: u32,
    _kind: PhantomData<fn() -> K>,
}

/// Handle to a fiber slot
pub type FiberId = Handle<FiberTag>;

/// Handle to a channel slot
pub type ChanId = Handle<ChanTag>;

impl<K> Handle<K> {
    /// Sentinel for "no object"
    pub const NONE: Self = Self {
        idx: u32::MAX,
        gen: 0,
        _kind: PhantomData,
    };

    /// Assemble a handle from a slot index and that slot's current
    /// generation; only arenas do this
    pub const fn from_parts(idx: u32, gen: u32) -> Self {
        Self {
            idx,
            gen,
            _kind: PhantomData,
        }
    }

    /// Slot index into the owning table
    #[inline]
    pub const fn index(self) -> usize {
        self.idx as usize
    }

    /// Raw slot index
    #[inline]
    pub const fn raw(self) -> u32 {
        self.idx
    }

    /// Generation this handle was issued under
    #[inline]
    pub const fn generation(self) -> u32 {
        self.gen
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.idx == u32::MAX
    }
}

// Manual impls: derives would put bounds on the marker type.

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && self.gen == other.gen
    }
}

impl<K> Eq for Handle<K> {}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Handle(none)")
        } else {
            write!(f, "Handle({}v{})", self.idx, self.gen)
        }
    }
}

impl<K> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.idx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_parts() {
        let h = FiberId::from_parts(42, 3);
        assert_eq!(h.index(), 42);
        assert_eq!(h.raw(), 42);
        assert_eq!(h.generation(), 3);
        assert!(!h.is_none());
    }

    #[test]
    fn test_generation_distinguishes_recycled_slots() {
        let first = ChanId::from_parts(7, 0);
        let recycled = ChanId::from_parts(7, 1);
        assert_ne!(first, recycled);
        assert_eq!(first.index(), recycled.index());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(format!("{}", FiberId::NONE), "none");
        assert_eq!(format!("{}", FiberId::from_parts(5, 9)), "5");
    }
}
