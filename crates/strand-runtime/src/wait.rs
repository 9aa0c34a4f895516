//! The wait engine
//!
//! Every blocking primitive funnels through [`Runtime::park`]: build one
//! or more clauses, try to complete one immediately, otherwise enqueue
//! all of them and switch away. Whoever fires a clause unlinks every
//! sibling before the fiber is resumed, so exactly one clause wins.
//!
//! Clause payloads hold raw pointers into the parked fiber's stack
//! frame; they are valid precisely while the fiber is Blocked, which is
//! the only time the runtime dereferences them.

use std::os::unix::io::RawFd;

use strand_core::{ChanId, FiberId, FiberState, RtError, RtResult};

use crate::poller::{EV_IN, EV_OUT};
use crate::sched::Runtime;

/// One way a parked fiber may unblock
pub enum ClauseKind {
    /// Offer `len` bytes at `src` to a channel
    Send {
        ch: ChanId,
        src: *const u8,
        len: usize,
    },
    /// Accept an item from a channel into `dst`
    Recv {
        ch: ChanId,
        dst: *mut u8,
        len: usize,
    },
    /// Wait for fd readiness
    Fd { fd: RawFd, events: u32 },
    /// Wait for every cancel target to finish (used by `gocancel`)
    Reap,
}

/// Wait-set element
///
/// The value buffers referenced by a clause must stay valid until the
/// blocking call returns; rendezvous copies straight between fiber
/// stacks.
pub struct Clause {
    pub(crate) kind: ClauseKind,
    pub(crate) revents: u32,
    pub(crate) status: Option<RtError>,
}

impl Clause {
    pub fn send(ch: ChanId, src: &[u8]) -> Self {
        Self {
            kind: ClauseKind::Send {
                ch,
                src: src.as_ptr(),
                len: src.len(),
            },
            revents: 0,
            status: None,
        }
    }

    pub fn recv(ch: ChanId, dst: &mut [u8]) -> Self {
        Self {
            kind: ClauseKind::Recv {
                ch,
                dst: dst.as_mut_ptr(),
                len: dst.len(),
            },
            revents: 0,
            status: None,
        }
    }

    pub fn fd(fd: RawFd, events: u32) -> Self {
        Self {
            kind: ClauseKind::Fd { fd, events },
            revents: 0,
            status: None,
        }
    }

    pub(crate) fn reap() -> Self {
        Self {
            kind: ClauseKind::Reap,
            revents: 0,
            status: None,
        }
    }

    /// Outcome of the operation this clause performed when it fired
    pub fn result(&self) -> RtResult<()> {
        match self.status {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// For fd clauses: the subset of requested events that fired
    #[inline]
    pub fn revents(&self) -> u32 {
        self.revents
    }
}

impl Runtime {
    /// Park the current fiber on a set of clauses
    ///
    /// Returns the index of the firing clause. `deadline` is absolute
    /// monotonic ms: -1 never, 0 probe-only. With `randomize`, ties
    /// between immediately-ready clauses are broken uniformly at random
    /// instead of by array order.
    pub fn park(
        &mut self,
        clauses: &mut [Clause],
        deadline: i64,
        randomize: bool,
    ) -> RtResult<usize> {
        self.park_inner(clauses, deadline, randomize, true)
    }

    pub(crate) fn park_inner(
        &mut self,
        clauses: &mut [Clause],
        deadline: i64,
        randomize: bool,
        check_cancel: bool,
    ) -> RtResult<usize> {
        let me = self.current;
        if check_cancel && self.block(me).is_canceled() {
            return Err(RtError::Canceled);
        }

        // Structural validation of the whole set before any side effect
        for c in clauses.iter() {
            self.validate_clause(c)?;
        }

        // Immediate-completion probe
        let mut ready: Vec<usize> = Vec::new();
        for (i, c) in clauses.iter().enumerate() {
            if self.clause_ready(c)? {
                ready.push(i);
            }
        }
        if !ready.is_empty() {
            let pick = if randomize && ready.len() > 1 {
                (self.next_rand() as usize) % ready.len()
            } else {
                0
            };
            let idx = ready[pick];
            self.complete_immediate(&mut clauses[idx]);
            return Ok(idx);
        }

        if deadline == 0 {
            return Err(RtError::TimedOut);
        }

        // Enqueue every clause, then switch away
        let seq = self.next_wait_seq();
        self.block_mut(me)
            .begin_wait(clauses.as_mut_ptr() as *mut u8, clauses.len(), seq);
        for (i, c) in clauses.iter().enumerate() {
            if let Err(e) = self.enqueue_clause(me, i, c) {
                // Undo the prefix already enqueued
                for (j, prev) in clauses[..i].iter().enumerate() {
                    self.remove_clause(me, j, prev);
                }
                self.block_mut(me).end_wait();
                return Err(e);
            }
        }
        if deadline > 0 {
            self.timers.insert(deadline, me, seq);
        }
        self.block_mut(me).set_state(FiberState::Blocked);
        self.schedule_out(me);

        let blk = self.block(me);
        if blk.wait_status == 0 {
            Ok(blk.fired as usize)
        } else {
            Err(RtError::from_errno(blk.wait_status).unwrap_or(RtError::BadArg))
        }
    }

    /// Select over channel clauses; bias broken randomly between ready ones
    pub fn choose(&mut self, clauses: &mut [Clause], deadline: i64) -> RtResult<usize> {
        if clauses.is_empty() {
            return Err(RtError::BadArg);
        }
        for c in clauses.iter() {
            match c.kind {
                ClauseKind::Send { .. } | ClauseKind::Recv { .. } => {}
                _ => return Err(RtError::BadArg),
            }
        }
        self.park(clauses, deadline, true)
    }

    fn validate_clause(&self, c: &Clause) -> RtResult<()> {
        match c.kind {
            ClauseKind::Send { ch, len, .. } | ClauseKind::Recv { ch, len, .. } => {
                let core = self.chans.get(ch).ok_or(RtError::BadArg)?;
                if len != core.item_size {
                    return Err(RtError::BadArg);
                }
                Ok(())
            }
            ClauseKind::Fd { fd, events } => {
                if fd < 0 {
                    return Err(RtError::BadFd);
                }
                if events == 0 || events & !(EV_IN | EV_OUT) != 0 {
                    return Err(RtError::BadArg);
                }
                Ok(())
            }
            ClauseKind::Reap => Ok(()),
        }
    }

    fn clause_ready(&mut self, c: &Clause) -> RtResult<bool> {
        match c.kind {
            ClauseKind::Send { ch, .. } => Ok(self.chan_send_ready(ch)),
            ClauseKind::Recv { ch, .. } => Ok(self.chan_recv_ready(ch)),
            ClauseKind::Fd { fd, events } => Ok(self.poller.probe(fd, events)? != 0),
            ClauseKind::Reap => Ok(self.block(self.current).reap_pending == 0),
        }
    }

    fn complete_immediate(&mut self, c: &mut Clause) {
        match c.kind {
            ClauseKind::Send { .. } => self.complete_send(c),
            ClauseKind::Recv { .. } => self.complete_recv(c),
            ClauseKind::Fd { fd, events } => {
                c.revents = self.poller.probe(fd, events).unwrap_or(0);
                c.status = None;
            }
            ClauseKind::Reap => {
                c.status = None;
            }
        }
    }

    fn enqueue_clause(&mut self, me: FiberId, idx: usize, c: &Clause) -> RtResult<()> {
        match c.kind {
            ClauseKind::Send { ch, .. } => {
                self.chans
                    .get_mut(ch)
                    .ok_or(RtError::BadArg)?
                    .sendq
                    .push_back((me, idx));
                Ok(())
            }
            ClauseKind::Recv { ch, .. } => {
                self.chans
                    .get_mut(ch)
                    .ok_or(RtError::BadArg)?
                    .recvq
                    .push_back((me, idx));
                Ok(())
            }
            ClauseKind::Fd { fd, events } => self.poller.arm(fd, events, me, idx),
            ClauseKind::Reap => Ok(()),
        }
    }

    pub(crate) fn remove_clause(&mut self, me: FiberId, idx: usize, c: &Clause) {
        match c.kind {
            ClauseKind::Send { ch, .. } => {
                if let Some(core) = self.chans.get_mut(ch) {
                    core.sendq.retain(|&(f, i)| !(f == me && i == idx));
                }
            }
            ClauseKind::Recv { ch, .. } => {
                if let Some(core) = self.chans.get_mut(ch) {
                    core.recvq.retain(|&(f, i)| !(f == me && i == idx));
                }
            }
            ClauseKind::Fd { fd, events } => self.poller.disarm(fd, events, me),
            ClauseKind::Reap => {}
        }
    }

    /// Unlink every clause of a blocked fiber's wait set
    ///
    /// Timer entries die lazily: `end_wait` clears the wait sequence so
    /// any heap entry created for this park no longer matches.
    pub(crate) fn unlink_waitset(&mut self, id: FiberId) {
        let (ptr, len) = {
            let b = self.block(id);
            (b.wait_clauses as *const Clause, b.wait_len)
        };
        if !ptr.is_null() && len > 0 {
            let clauses = unsafe { std::slice::from_raw_parts(ptr, len) };
            for (i, c) in clauses.iter().enumerate() {
                self.remove_clause(id, i, c);
            }
        }
        self.block_mut(id).end_wait();
    }

    /// Conclude a blocked fiber's wait and queue it for resumption
    pub(crate) fn wake_with(&mut self, id: FiberId, fired: i32, err: Option<RtError>) {
        debug_assert_eq!(self.block(id).fiber_state(), FiberState::Blocked);
        self.unlink_waitset(id);
        let blk = self.block_mut(id);
        blk.fired = fired;
        blk.wait_status = err.map(|e| e.errno()).unwrap_or(0);
        blk.set_state(FiberState::Ready);
        self.ready.push_back(id);
    }

    /// Raw pointer to clause `idx` of a blocked fiber's wait set
    ///
    /// Valid only while the fiber stays Blocked.
    pub(crate) fn clause_ptr(&self, id: FiberId, idx: usize) -> *mut Clause {
        let b = self.block(id);
        debug_assert!(idx < b.wait_len);
        let base = b.wait_clauses as *mut Clause;
        unsafe { base.add(idx) }
    }
}
