//! Channels
//!
//! A channel is a bounded FIFO of fixed-size items plus two queues of
//! parked fibers. At any instant at most one of the two waiter queues is
//! non-empty: a waiting partner always rendezvouses immediately.
//!
//! `done` is a terminal latch: it fails every parked and future sender
//! with `Pipe`, and broadcasts a final value to every parked and future
//! receiver once the buffer has drained.

use std::collections::VecDeque;

use strand_core::{ChanId, FiberId, FiberState, RtError, RtResult};

use crate::sched::Runtime;
use crate::wait::{Clause, ClauseKind};

/// Channel state
pub(crate) struct ChanCore {
    pub item_size: usize,
    pub capacity: usize,
    pub refs: usize,
    pub done: bool,
    done_val: Vec<u8>,

    /// Ring of `capacity` cells of `item_size` bytes
    ring: Vec<u8>,
    head: usize,
    len: usize,

    /// Parked senders / receivers as (fiber, clause index), FIFO
    pub sendq: VecDeque<(FiberId, usize)>,
    pub recvq: VecDeque<(FiberId, usize)>,
}

impl ChanCore {
    fn new(item_size: usize, capacity: usize) -> Self {
        Self {
            item_size,
            capacity,
            refs: 1,
            done: false,
            done_val: Vec::new(),
            ring: vec![0u8; capacity * item_size],
            head: 0,
            len: 0,
            sendq: VecDeque::new(),
            recvq: VecDeque::new(),
        }
    }

    #[inline]
    pub fn buf_len(&self) -> usize {
        self.len
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Copy one item into the ring tail
    ///
    /// # Safety
    ///
    /// `src` must point at `item_size` readable bytes; the ring must not
    /// be full.
    unsafe fn buf_push(&mut self, src: *const u8) {
        debug_assert!(!self.is_full());
        let slot = (self.head + self.len) % self.capacity;
        std::ptr::copy_nonoverlapping(
            src,
            self.ring.as_mut_ptr().add(slot * self.item_size),
            self.item_size,
        );
        self.len += 1;
    }

    /// Copy the ring head out
    ///
    /// # Safety
    ///
    /// `dst` must point at `item_size` writable bytes; the ring must not
    /// be empty.
    unsafe fn buf_pop(&mut self, dst: *mut u8) {
        debug_assert!(self.len > 0);
        std::ptr::copy_nonoverlapping(
            self.ring.as_ptr().add(self.head * self.item_size),
            dst,
            self.item_size,
        );
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
    }
}

/// Arena of live channels, indexed by `ChanId`
///
/// Slots carry a generation bumped on free, so a handle retained past
/// the last `chan_close` stops resolving instead of reaching whatever
/// channel recycles the slot.
pub(crate) struct ChanArena {
    slots: Vec<Option<Box<ChanCore>>>,
    gens: Vec<u32>,
    free: Vec<u32>,
    live: usize,
    max: usize,
}

impl ChanArena {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            gens: Vec::new(),
            free: Vec::new(),
            live: 0,
            max,
        }
    }

    pub fn make(&mut self, item_size: usize, capacity: usize) -> RtResult<ChanId> {
        if self.live >= self.max {
            return Err(RtError::Oom);
        }
        capacity.checked_mul(item_size).ok_or(RtError::Oom)?;
        let core = Box::new(ChanCore::new(item_size, capacity));
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(core);
                i
            }
            None => {
                self.slots.push(Some(core));
                self.gens.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;
        Ok(ChanId::from_parts(idx, self.gens[idx as usize]))
    }

    fn check_gen(&self, id: ChanId) -> bool {
        self.gens.get(id.index()).copied() == Some(id.generation())
    }

    pub fn get(&self, id: ChanId) -> Option<&ChanCore> {
        if !self.check_gen(id) {
            return None;
        }
        self.slots.get(id.index())?.as_deref()
    }

    pub fn get_mut(&mut self, id: ChanId) -> Option<&mut ChanCore> {
        if !self.check_gen(id) {
            return None;
        }
        self.slots.get_mut(id.index())?.as_deref_mut()
    }

    fn remove(&mut self, id: ChanId) {
        if !self.check_gen(id) {
            return;
        }
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if slot.take().is_some() {
                self.gens[id.index()] = self.gens[id.index()].wrapping_add(1);
                self.free.push(id.raw());
                self.live -= 1;
            }
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }
}

impl Runtime {
    /// Create a channel of `capacity` items of `item_size` bytes
    ///
    /// Capacity 0 makes the channel unbuffered: every transfer is a
    /// rendezvous.
    pub fn chan_make(&mut self, item_size: usize, capacity: usize) -> RtResult<ChanId> {
        self.chans.make(item_size, capacity)
    }

    /// Send one item; `src.len()` must equal the channel's item size
    pub fn chan_send(&mut self, ch: ChanId, src: &[u8], deadline: i64) -> RtResult<()> {
        let mut clause = [Clause::send(ch, src)];
        self.park(&mut clause, deadline, false)?;
        clause[0].result()
    }

    /// Receive one item into `dst`
    pub fn chan_recv(&mut self, ch: ChanId, dst: &mut [u8], deadline: i64) -> RtResult<()> {
        let mut clause = [Clause::recv(ch, dst)];
        self.park(&mut clause, deadline, false)?;
        clause[0].result()
    }

    /// Latch the channel done with a final value
    ///
    /// Wakes every parked sender with `Pipe` and delivers a copy of
    /// `val` to every parked receiver. Subsequent receives keep getting
    /// `val` (after the buffer drains); subsequent sends fail `Pipe`.
    pub fn chan_done(&mut self, ch: ChanId, val: &[u8]) -> RtResult<()> {
        let (senders, receivers) = {
            let core = self.chans.get_mut(ch).ok_or(RtError::BadArg)?;
            if val.len() != core.item_size {
                return Err(RtError::BadArg);
            }
            if core.done {
                return Err(RtError::Pipe);
            }
            core.done = true;
            core.done_val = val.to_vec();
            // Waiter queues are snapshotted here; wake_with's unlink
            // pass sees them already empty, which is exactly the done
            // invariant.
            let s: Vec<_> = core.sendq.drain(..).collect();
            let r: Vec<_> = core.recvq.drain(..).collect();
            (s, r)
        };

        // A fiber choosing over several clauses of this same channel
        // appears in the snapshots more than once; only its first entry
        // finds it still Blocked.
        for (f, i) in senders {
            if self.block(f).fiber_state() != FiberState::Blocked {
                continue;
            }
            unsafe {
                (*self.clause_ptr(f, i)).status = Some(RtError::Pipe);
            }
            self.wake_with(f, i as i32, None);
        }
        for (f, i) in receivers {
            if self.block(f).fiber_state() != FiberState::Blocked {
                continue;
            }
            let cp = self.clause_ptr(f, i);
            unsafe {
                if let ClauseKind::Recv { dst, len, .. } = (*cp).kind {
                    debug_assert_eq!(len, val.len());
                    std::ptr::copy_nonoverlapping(val.as_ptr(), dst, len);
                }
                (*cp).status = None;
            }
            self.wake_with(f, i as i32, None);
        }
        Ok(())
    }

    /// Take another reference to the channel
    pub fn chan_dup(&mut self, ch: ChanId) -> RtResult<ChanId> {
        let core = self.chans.get_mut(ch).ok_or(RtError::BadArg)?;
        core.refs += 1;
        Ok(ch)
    }

    /// Drop one reference; the last drop frees the channel
    ///
    /// Closing a channel that still has parked waiters is a program bug:
    /// the wait set of any parked fiber is what keeps the channel alive.
    pub fn chan_close(&mut self, ch: ChanId) -> RtResult<()> {
        let free = {
            let core = self.chans.get_mut(ch).ok_or(RtError::BadArg)?;
            debug_assert!(core.refs > 0);
            core.refs -= 1;
            if core.refs == 0 {
                if !core.sendq.is_empty() || !core.recvq.is_empty() {
                    panic!(
                        "chan_close({:?}) with parked waiters ({} senders, {} receivers)",
                        ch,
                        core.sendq.len(),
                        core.recvq.len()
                    );
                }
                true
            } else {
                false
            }
        };
        if free {
            self.chans.remove(ch);
        }
        Ok(())
    }

    /// A send clause can complete without parking
    pub(crate) fn chan_send_ready(&self, ch: ChanId) -> bool {
        let core = match self.chans.get(ch) {
            Some(c) => c,
            None => return false,
        };
        core.done || !core.recvq.is_empty() || !core.is_full()
    }

    /// A receive clause can complete without parking
    pub(crate) fn chan_recv_ready(&self, ch: ChanId) -> bool {
        let core = match self.chans.get(ch) {
            Some(c) => c,
            None => return false,
        };
        core.buf_len() > 0 || !core.sendq.is_empty() || core.done
    }

    /// Perform a ready send clause
    pub(crate) fn complete_send(&mut self, c: &mut Clause) {
        let (ch, src) = match c.kind {
            ClauseKind::Send { ch, src, .. } => (ch, src),
            _ => unreachable!("complete_send on non-send clause"),
        };

        let popped = {
            let core = self.chans.get_mut(ch).expect("channel vanished");
            if core.done {
                c.status = Some(RtError::Pipe);
                return;
            }
            core.recvq.pop_front()
        };

        match popped {
            Some((rf, ridx)) => {
                // Rendezvous: copy straight into the parked receiver
                let rp = self.clause_ptr(rf, ridx);
                unsafe {
                    if let ClauseKind::Recv { dst, len, .. } = (*rp).kind {
                        std::ptr::copy_nonoverlapping(src, dst, len);
                    } else {
                        unreachable!("receiver queue points at non-recv clause");
                    }
                    (*rp).status = None;
                }
                self.wake_with(rf, ridx as i32, None);
            }
            None => {
                let core = self.chans.get_mut(ch).expect("channel vanished");
                unsafe { core.buf_push(src) };
            }
        }
        c.status = None;
    }

    /// Perform a ready receive clause
    pub(crate) fn complete_recv(&mut self, c: &mut Clause) {
        let (ch, dst) = match c.kind {
            ClauseKind::Recv { ch, dst, .. } => (ch, dst),
            _ => unreachable!("complete_recv on non-recv clause"),
        };

        enum Src {
            /// Buffer head, optionally rotating a parked sender in
            Buffered(Option<(FiberId, usize)>),
            /// Direct copy from a parked sender
            Direct(FiberId, usize),
            /// Latched final value
            DoneVal,
        }

        let action = {
            let core = self.chans.get_mut(ch).expect("channel vanished");
            if core.buf_len() > 0 {
                Src::Buffered(core.sendq.pop_front())
            } else if let Some(s) = core.sendq.pop_front() {
                Src::Direct(s.0, s.1)
            } else {
                debug_assert!(core.done);
                Src::DoneVal
            }
        };

        match action {
            Src::Buffered(waiting_sender) => {
                {
                    let core = self.chans.get_mut(ch).expect("channel vanished");
                    unsafe { core.buf_pop(dst) };
                }
                if let Some((sf, sidx)) = waiting_sender {
                    // FIFO over the logical channel: the freed cell takes
                    // the longest-parked sender's value.
                    let sp = self.clause_ptr(sf, sidx);
                    let ssrc = unsafe {
                        match (*sp).kind {
                            ClauseKind::Send { src, .. } => src,
                            _ => unreachable!("sender queue points at non-send clause"),
                        }
                    };
                    {
                        let core = self.chans.get_mut(ch).expect("channel vanished");
                        unsafe { core.buf_push(ssrc) };
                    }
                    unsafe {
                        (*sp).status = None;
                    }
                    self.wake_with(sf, sidx as i32, None);
                }
            }
            Src::Direct(sf, sidx) => {
                let sp = self.clause_ptr(sf, sidx);
                unsafe {
                    match (*sp).kind {
                        ClauseKind::Send { src, len, .. } => {
                            std::ptr::copy_nonoverlapping(src, dst, len);
                        }
                        _ => unreachable!("sender queue points at non-send clause"),
                    }
                    (*sp).status = None;
                }
                self.wake_with(sf, sidx as i32, None);
            }
            Src::DoneVal => {
                let core = self.chans.get(ch).expect("channel vanished");
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        core.done_val.as_ptr(),
                        dst,
                        core.item_size,
                    );
                }
            }
        }
        c.status = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::{chan_close, chan_done, chan_dup, chan_make, chan_recv, chan_send};
    use strand_core::RtError;

    #[test]
    fn test_buffered_fifo() {
        let ch = chan_make(4, 2).unwrap();
        chan_send(ch, &1u32.to_ne_bytes(), 0).unwrap();
        chan_send(ch, &2u32.to_ne_bytes(), 0).unwrap();
        // Full: a zero-deadline probe fails without parking
        assert_eq!(
            chan_send(ch, &3u32.to_ne_bytes(), 0),
            Err(RtError::TimedOut)
        );

        let mut buf = [0u8; 4];
        chan_recv(ch, &mut buf, 0).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), 1);
        chan_recv(ch, &mut buf, 0).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), 2);
        chan_close(ch).unwrap();
    }

    #[test]
    fn test_item_size_mismatch() {
        let ch = chan_make(4, 1).unwrap();
        assert_eq!(chan_send(ch, &[0u8; 2], -1), Err(RtError::BadArg));
        let mut small = [0u8; 2];
        assert_eq!(chan_recv(ch, &mut small, -1), Err(RtError::BadArg));
        chan_close(ch).unwrap();
    }

    #[test]
    fn test_done_latch() {
        let ch = chan_make(8, 0).unwrap();
        chan_done(ch, &7i64.to_ne_bytes()).unwrap();
        assert_eq!(chan_done(ch, &7i64.to_ne_bytes()), Err(RtError::Pipe));
        assert_eq!(
            chan_send(ch, &1i64.to_ne_bytes(), -1),
            Err(RtError::Pipe)
        );

        // The final value repeats without blocking
        let mut buf = [0u8; 8];
        chan_recv(ch, &mut buf, -1).unwrap();
        assert_eq!(i64::from_ne_bytes(buf), 7);
        chan_recv(ch, &mut buf, -1).unwrap();
        assert_eq!(i64::from_ne_bytes(buf), 7);
        chan_close(ch).unwrap();
    }

    #[test]
    fn test_dup_keeps_channel_alive() {
        let ch = chan_make(1, 1).unwrap();
        let dup = chan_dup(ch).unwrap();
        assert_eq!(dup, ch);

        chan_close(dup).unwrap();
        chan_send(ch, &[9u8], 0).unwrap();
        let mut b = [0u8];
        chan_recv(ch, &mut b, 0).unwrap();
        assert_eq!(b[0], 9);

        chan_close(ch).unwrap();
        // The handle is dead once the last reference is gone
        assert_eq!(chan_send(ch, &[1u8], 0), Err(RtError::BadArg));
    }
}
