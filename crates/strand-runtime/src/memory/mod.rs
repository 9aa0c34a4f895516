//! Stack slot region for fibers
//!
//! One large PROT_NONE reservation holds every fiber slot; slots are made
//! accessible on allocation and recycled through a LIFO free list so a
//! recently released stack is the next one handed out.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    } else {
        compile_error!("Unsupported platform");
    }
}

use strand_core::fiber::{BLOCK_SIZE, GUARD_SIZE};
use strand_core::{FiberBlock, FiberId, RtError, RtResult};

/// Reserved virtual region of fiber slots plus the slot allocator
pub struct SlotRegion {
    base: *mut u8,
    slot_size: usize,
    total_size: usize,
    max_slots: usize,

    /// LIFO stack of released slot indices
    free: Vec<u32>,

    /// Current generation per slot ever handed out; the vector length
    /// doubles as the fresh-slot watermark. Release bumps the
    /// generation, so a handle issued before the bump stops validating.
    gens: Vec<u32>,

    live: usize,
}

impl SlotRegion {
    /// Reserve address space for `max_slots` slots with the given stack size
    pub fn new(max_slots: usize, stack_size: usize) -> RtResult<Self> {
        let slot_size = BLOCK_SIZE + GUARD_SIZE + stack_size;
        let total_size = max_slots.checked_mul(slot_size).ok_or(RtError::Oom)?;

        let base = Self::map_region(total_size)?;

        Ok(Self {
            base,
            slot_size,
            total_size,
            max_slots,
            free: Vec::with_capacity(max_slots.min(1024)),
            gens: Vec::with_capacity(max_slots.min(1024)),
            live: 0,
        })
    }

    /// Allocate a slot and return its handle, preferring recycled slots
    pub fn allocate(&mut self) -> RtResult<FiberId> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                if self.gens.len() >= self.max_slots {
                    return Err(RtError::Oom);
                }
                self.gens.push(0);
                (self.gens.len() - 1) as u32
            }
        };
        self.activate_slot(idx)?;
        self.live += 1;
        Ok(FiberId::from_parts(idx, self.gens[idx as usize]))
    }

    /// Return a slot to the free list, dropping its physical pages
    ///
    /// The generation bump invalidates every outstanding handle to the
    /// slot before it can be recycled.
    pub fn release(&mut self, id: FiberId) {
        debug_assert!(self.is_valid(id));
        self.deactivate_slot(id.raw());
        self.gens[id.index()] = self.gens[id.index()].wrapping_add(1);
        self.free.push(id.raw());
        self.live -= 1;
    }

    /// Does this handle still refer to the fiber it was issued for?
    ///
    /// Stale handles (already reaped, or reaped and recycled into a
    /// different fiber) fail the generation comparison.
    #[inline]
    pub fn is_valid(&self, id: FiberId) -> bool {
        !id.is_none()
            && id.index() < self.gens.len()
            && self.gens[id.index()] == id.generation()
    }

    /// Handle for the live occupant of a slot
    ///
    /// Used when only a raw slot index was recorded (e.g. the reaper
    /// back-link in a control block); the slot must be allocated.
    #[inline]
    pub fn live_handle(&self, idx: u32) -> FiberId {
        debug_assert!((idx as usize) < self.gens.len());
        FiberId::from_parts(idx, self.gens[idx as usize])
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    fn slot_base(&self, slot_idx: u32) -> *mut u8 {
        debug_assert!((slot_idx as usize) < self.max_slots);
        unsafe { self.base.add(slot_idx as usize * self.slot_size) }
    }

    /// Control block of a slot, at the slot base
    #[inline]
    pub fn block_ptr(&self, id: FiberId) -> *mut FiberBlock {
        self.slot_base(id.raw()) as *mut FiberBlock
    }

    /// Upper end of a slot's stack (stacks grow down toward the guard page)
    #[inline]
    pub fn stack_top(&self, id: FiberId) -> *mut u8 {
        unsafe { self.slot_base(id.raw()).add(self.slot_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::MIN_STACK_SIZE;

    #[test]
    fn test_allocate_sequential_and_reuse() {
        let mut region = SlotRegion::new(16, MIN_STACK_SIZE).unwrap();

        let a = region.allocate().unwrap();
        let b = region.allocate().unwrap();
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        assert_eq!(region.live(), 2);

        region.release(a);
        assert_eq!(region.live(), 1);

        // LIFO reuse of the slot, but under a fresh generation
        let c = region.allocate().unwrap();
        assert_eq!(c.raw(), a.raw());
        assert_ne!(c, a);
    }

    #[test]
    fn test_stale_handles_fail_validation() {
        let mut region = SlotRegion::new(4, MIN_STACK_SIZE).unwrap();

        let a = region.allocate().unwrap();
        assert!(region.is_valid(a));

        region.release(a);
        // Reaped: the handle no longer validates
        assert!(!region.is_valid(a));

        // Recycled into a different fiber: the old handle must not
        // alias the new occupant
        let b = region.allocate().unwrap();
        assert!(region.is_valid(b));
        assert!(!region.is_valid(a));
        assert_eq!(region.live_handle(a.raw()), b);
    }

    #[test]
    fn test_exhaustion() {
        let mut region = SlotRegion::new(2, MIN_STACK_SIZE).unwrap();
        region.allocate().unwrap();
        region.allocate().unwrap();
        assert_eq!(region.allocate(), Err(RtError::Oom));
    }

    #[test]
    fn test_block_is_writable_after_allocate() {
        let mut region = SlotRegion::new(4, MIN_STACK_SIZE).unwrap();
        let id = region.allocate().unwrap();
        let blk = unsafe { &mut *region.block_ptr(id) };
        blk.init(id);
        assert_eq!(blk.id, id.raw());

        // The stack just below the top must be writable too
        unsafe {
            let top = region.stack_top(id);
            std::ptr::write_bytes(top.sub(64), 0xAB, 64);
        }
    }
}
