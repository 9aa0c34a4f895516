//! Fiber control block and saved register context
//!
//! Each fiber occupies one slot in the runtime's reserved memory region:
//!
//! ```text
//! slot base ──► ┌──────────────────┐
//!               │  FiberBlock      │  one page, control state + saved regs
//!               ├──────────────────┤
//!               │  guard page      │  PROT_NONE, catches stack overflow
//!               ├──────────────────┤
//!               │  stack           │  grows downward from the slot end
//! slot end  ──► └──────────────────┘
//! ```
//!
//! The layout is repr(C) with the register context at offset 0; the
//! architecture switch code receives a raw pointer to it.

use crate::id::FiberId;
use crate::state::FiberState;

/// Base page size assumed for slot layout math
pub const PAGE_SIZE: usize = 4096;

/// Size of the control-block area at the start of each slot
pub const BLOCK_SIZE: usize = PAGE_SIZE;

/// Size of the guard page between control block and stack
pub const GUARD_SIZE: usize = PAGE_SIZE;

/// Smallest stack the runtime will accept
pub const MIN_STACK_SIZE: usize = 256 * 1024;

/// Sentinel for "no fiber" in raw u32 fields
pub const FIBER_NONE: u32 = u32::MAX;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Callee-saved register context, System V AMD64
        ///
        /// Offsets are fixed for the assembly switcher:
        /// 0x00 rsp, 0x08 rip, 0x10 rbx, 0x18 rbp, 0x20 r12,
        /// 0x28 r13, 0x30 r14, 0x38 r15.
        #[repr(C)]
        #[derive(Default)]
        pub struct Context {
            pub rsp: u64,
            pub rip: u64,
            pub rbx: u64,
            pub rbp: u64,
            pub r12: u64,
            pub r13: u64,
            pub r14: u64,
            pub r15: u64,
        }

        const _: () = assert!(core::mem::size_of::<Context>() == 64);
    } else if #[cfg(target_arch = "aarch64")] {
        /// Callee-saved register context, AAPCS64
        ///
        /// Offsets fixed for the assembly switcher:
        /// 0x00 sp, 0x08 pc, 0x10 x19..x28 (pairs), 0x60 x29/x30,
        /// 0x70 d8..d15 (pairs).
        #[repr(C)]
        #[derive(Default)]
        pub struct Context {
            pub sp: u64,
            pub pc: u64,
            pub x19_28: [u64; 10],
            pub fp: u64,
            pub lr: u64,
            pub d8_15: [u64; 8],
        }

        const _: () = assert!(core::mem::size_of::<Context>() == 176);
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Per-fiber control state, written in place at the slot base
///
/// Plain fields, no atomics: the entire runtime lives on one OS thread
/// and mutation only happens between context switches.
#[repr(C)]
pub struct FiberBlock {
    /// Saved registers. Must stay at offset 0; the switcher is handed
    /// a pointer to the block directly.
    pub ctx: Context,

    pub id: u32,
    pub state: u8,
    pub canceled: u8,
    _pad: [u8; 2],

    /// Fiber parked in a cancel wait on us, FIBER_NONE otherwise
    pub reaper: u32,

    /// While we are the canceller: targets not yet finished
    pub reap_pending: u32,

    /// Launch protocol: entry_fn(entry_arg) runs on first switch-in
    pub entry_fn: usize,
    pub entry_arg: usize,

    /// Coroutine-local storage slot
    pub cls: usize,

    /// Bumped at every park; timer-heap entries carry the value they
    /// were created under and are ignored when stale
    pub wait_seq: u64,

    /// Raw pointer + length of the clause array, valid only while Blocked
    pub wait_clauses: usize,
    pub wait_len: usize,

    /// Index of the clause that fired, -1 when none (timeout/cancel)
    pub fired: i32,

    /// errno-style status of the completed wait, 0 = ok
    pub wait_status: i32,
}

const _: () = assert!(core::mem::size_of::<FiberBlock>() <= BLOCK_SIZE);

impl FiberBlock {
    /// Reset the block for a fresh fiber in this slot
    ///
    /// Only the slot index is recorded; the handle's generation lives
    /// with the slot allocator, which survives slot recycling (this
    /// memory does not).
    pub fn init(&mut self, id: FiberId) {
        self.ctx = Context::default();
        self.id = id.raw();
        self.state = FiberState::Created as u8;
        self.canceled = 0;
        self.reaper = FIBER_NONE;
        self.reap_pending = 0;
        self.entry_fn = 0;
        self.entry_arg = 0;
        self.cls = 0;
        self.wait_seq = 0;
        self.wait_clauses = 0;
        self.wait_len = 0;
        self.fired = -1;
        self.wait_status = 0;
    }

    #[inline]
    pub fn fiber_state(&self) -> FiberState {
        FiberState::from(self.state)
    }

    #[inline]
    pub fn set_state(&mut self, state: FiberState) {
        self.state = state as u8;
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled != 0
    }

    /// Record a new park
    ///
    /// `seq` is the runtime's globally unique wait sequence; timer-heap
    /// entries match against it, so stale entries cannot fire across
    /// slot reuse.
    pub fn begin_wait(&mut self, clauses: *mut u8, len: usize, seq: u64) {
        self.wait_seq = seq;
        self.wait_clauses = clauses as usize;
        self.wait_len = len;
        self.fired = -1;
        self.wait_status = 0;
    }

    /// Drop the clause pointer once the wait concludes
    ///
    /// Sequence 0 is never handed out, so clearing it invalidates any
    /// timer entry created for this park.
    pub fn end_wait(&mut self) {
        self.wait_clauses = 0;
        self.wait_len = 0;
        self.wait_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_fits_one_page() {
        assert!(core::mem::size_of::<FiberBlock>() <= BLOCK_SIZE);
    }

    #[test]
    fn test_context_at_offset_zero() {
        let blk = unsafe { core::mem::zeroed::<FiberBlock>() };
        let base = &blk as *const _ as usize;
        assert_eq!(&blk.ctx as *const _ as usize - base, 0);
    }

    #[test]
    fn test_init_resets_wait_state() {
        let mut blk = unsafe { core::mem::zeroed::<FiberBlock>() };
        blk.init(FiberId::from_parts(7, 2));
        assert_eq!(blk.id, 7);
        assert_eq!(blk.fiber_state(), FiberState::Created);
        assert_eq!(blk.fired, -1);
        assert_eq!(blk.reaper, FIBER_NONE);
        assert!(!blk.is_canceled());
    }

    #[test]
    fn test_wait_seq_tracks_park() {
        let mut blk = unsafe { core::mem::zeroed::<FiberBlock>() };
        blk.init(FiberId::from_parts(0, 0));
        blk.begin_wait(core::ptr::null_mut(), 0, 17);
        assert_eq!(blk.wait_seq, 17);
        blk.end_wait();
        assert_eq!(blk.wait_seq, 0);
        assert_eq!(blk.wait_clauses, 0);
    }
}
