//! The single-threaded cooperative scheduler
//!
//! One OS thread owns one `Runtime` and every fiber multiplexed onto it.
//! There is no separate scheduler context: when a fiber suspends it pops
//! the next ready fiber and switches straight into it, polling the
//! kernel only when the ready queue runs dry. The runtime lives in
//! thread-local storage and is created lazily on first use.

use std::cell::Cell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use strand_core::fiber::FIBER_NONE;
use strand_core::{kerror, ktrace};
use strand_core::{FiberBlock, FiberId, FiberState, RtError, RtResult};

use crate::arch;
use crate::chan::ChanArena;
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::memory::SlotRegion;
use crate::poller::{FdEvent, Poller, EV_IN, EV_OUT};
use crate::timer::TimerHeap;
use crate::wait::Clause;

/// Per-thread fiber runtime
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) slots: SlotRegion,
    pub(crate) ready: VecDeque<FiberId>,
    pub(crate) current: FiberId,
    pub(crate) chans: ChanArena,
    pub(crate) timers: TimerHeap,
    pub(crate) poller: Poller,
    pub(crate) clock: Clock,

    /// Globally unique park sequence; 0 is reserved for "not waiting"
    wait_seq: u64,

    /// xorshift64 state for choose tie-breaking
    rng: u64,

    /// Scratch buffer reused across poll cycles
    fd_events: Vec<FdEvent>,
}

/// Snapshot of runtime occupancy (debug aid)
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    pub fibers_live: usize,
    pub ready: usize,
    pub chans_live: usize,
    pub timers: usize,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> RtResult<Self> {
        config.validate().map_err(|_| RtError::BadArg)?;

        let mut slots = SlotRegion::new(config.max_fibers, config.stack_size)?;

        // The calling thread itself is the root fiber. It gets a slot
        // for its control block but keeps running on the OS stack.
        let root = slots.allocate()?;
        let blk = unsafe { &mut *slots.block_ptr(root) };
        blk.init(root);
        blk.set_state(FiberState::Running);

        let max_chans = config.max_chans;
        Ok(Self {
            config,
            slots,
            ready: VecDeque::new(),
            current: root,
            chans: ChanArena::new(max_chans),
            timers: TimerHeap::new(),
            poller: Poller::new()?,
            clock: Clock::new(),
            wait_seq: 0,
            rng: crate::clock::raw_now_ms() as u64 | 1,
            fd_events: Vec::new(),
        })
    }

    #[inline]
    pub(crate) fn block(&self, id: FiberId) -> &FiberBlock {
        unsafe { &*self.slots.block_ptr(id) }
    }

    #[inline]
    pub(crate) fn block_mut(&mut self, id: FiberId) -> &mut FiberBlock {
        unsafe { &mut *self.slots.block_ptr(id) }
    }

    #[inline]
    pub(crate) fn next_wait_seq(&mut self) -> u64 {
        self.wait_seq += 1;
        self.wait_seq
    }

    #[inline]
    pub(crate) fn next_rand(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    /// Launch a new fiber at the tail of the ready queue
    ///
    /// The caller keeps running; the fiber first executes when the
    /// scheduler reaches it. The returned handle must eventually be
    /// passed to `cancel` or the slot (and stack) stays allocated.
    pub fn spawn(&mut self, f: Box<dyn FnOnce()>) -> RtResult<FiberId> {
        let id = self.slots.allocate()?;
        let top = self.slots.stack_top(id);

        let boxed: Box<Box<dyn FnOnce()>> = Box::new(f);
        let arg = Box::into_raw(boxed) as usize;

        let blk = unsafe { &mut *self.slots.block_ptr(id) };
        blk.init(id);
        blk.entry_fn = fiber_entry as usize;
        blk.entry_arg = arg;
        unsafe {
            arch::init_context(&mut blk.ctx, top, fiber_entry as usize, arg);
        }
        blk.set_state(FiberState::Ready);
        self.ready.push_back(id);
        ktrace!("spawned fiber {}", id);
        Ok(id)
    }

    /// Requeue the current fiber at the tail and run someone else
    pub fn yield_now(&mut self) -> RtResult<()> {
        let me = self.current;
        if self.block(me).is_canceled() {
            return Err(RtError::Canceled);
        }
        self.block_mut(me).set_state(FiberState::Ready);
        self.ready.push_back(me);
        self.schedule_out(me);
        Ok(())
    }

    /// Sleep until the absolute deadline
    ///
    /// Reaching the deadline is the success path; only cancellation
    /// surfaces an error.
    pub fn msleep(&mut self, deadline: i64) -> RtResult<()> {
        match self.park(&mut [], deadline, false) {
            Ok(_) | Err(RtError::TimedOut) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait for fd readiness; returns the subset of events that fired
    pub fn fd_wait(&mut self, fd: RawFd, events: u32, deadline: i64) -> RtResult<u32> {
        if fd < 0 {
            return Err(RtError::BadFd);
        }
        if events == 0 || events & !(EV_IN | EV_OUT) != 0 {
            return Err(RtError::BadArg);
        }
        let mut clause = [Clause::fd(fd, events)];
        self.park(&mut clause, deadline, false)?;
        clause[0].result()?;
        Ok(clause[0].revents())
    }

    /// Drop cached poller state for `fd`
    ///
    /// Must precede closing the descriptor, or the cache may later refer
    /// to a recycled fd number.
    pub fn fd_clean(&mut self, fd: RawFd) {
        self.poller.clean(fd);
    }

    /// Cancel fibers and reclaim their slots
    ///
    /// Targets get until `deadline` to finish on their own; after that
    /// their canceled flag is set and any blocked call aborts with
    /// `Canceled`. Returns only after every target has returned from its
    /// entry, even if the caller itself is canceled while waiting.
    pub fn cancel(&mut self, handles: &[FiberId], deadline: i64) -> RtResult<()> {
        let me = self.current;

        for (i, &h) in handles.iter().enumerate() {
            if h.is_none() || !self.slots.is_valid(h) || h == me {
                return Err(RtError::BadArg);
            }
            if handles[..i].contains(&h) {
                return Err(RtError::BadArg);
            }
            let b = self.block(h);
            if b.fiber_state() != FiberState::Finished && b.reaper != FIBER_NONE {
                // Another fiber is already reaping this one
                return Err(RtError::BadArg);
            }
        }

        let mut pending = 0u32;
        for &h in handles {
            let me_raw = me.raw();
            let b = self.block_mut(h);
            if b.fiber_state() != FiberState::Finished {
                b.reaper = me_raw;
                pending += 1;
            }
        }

        if pending == 0 {
            // Every target has already returned from its entry; just
            // free the stacks. No wait happens, so this succeeds even
            // when the caller itself carries a canceled flag.
            for &h in handles {
                self.slots.release(h);
            }
            ktrace!("reaped {} finished fiber(s)", handles.len());
            return Ok(());
        }

        let mut canceled_self = self.block(me).is_canceled();
        self.block_mut(me).reap_pending = pending;
        let mut grace_spent = deadline == 0;
        if grace_spent {
            self.hard_cancel(handles);
        }
        while self.block(me).reap_pending > 0 {
            let d = if grace_spent { -1 } else { deadline };
            let mut clause = [Clause::reap()];
            match self.park_inner(&mut clause, d, false, false) {
                Ok(_) => {}
                Err(RtError::TimedOut) => {
                    grace_spent = true;
                    self.hard_cancel(handles);
                }
                Err(RtError::Canceled) => {
                    // Our own owner wants us gone; finish reaping
                    // first, but stop being polite about the grace
                    // period.
                    canceled_self = true;
                    if !grace_spent {
                        grace_spent = true;
                        self.hard_cancel(handles);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        for &h in handles {
            debug_assert_eq!(self.block(h).fiber_state(), FiberState::Finished);
            self.slots.release(h);
        }
        ktrace!("reaped {} fiber(s)", handles.len());

        if canceled_self || self.block(me).is_canceled() {
            Err(RtError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Set the canceled flag on every unfinished target and abort any
    /// blocking call it is parked in
    fn hard_cancel(&mut self, handles: &[FiberId]) {
        for &h in handles {
            let state = {
                let b = self.block_mut(h);
                if b.fiber_state() == FiberState::Finished {
                    continue;
                }
                b.canceled = 1;
                b.fiber_state()
            };
            if state == FiberState::Blocked {
                self.wake_with(h, -1, Some(RtError::Canceled));
            }
        }
    }

    /// Coroutine-local storage: read the current fiber's slot
    pub fn cls(&self) -> usize {
        self.block(self.current).cls
    }

    /// Coroutine-local storage: set the current fiber's slot
    pub fn set_cls(&mut self, p: usize) {
        let me = self.current;
        self.block_mut(me).cls = p;
    }

    /// The configuration this runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            fibers_live: self.slots.live(),
            ready: self.ready.len(),
            chans_live: self.chans.live(),
            timers: self.timers.len(),
        }
    }

    /// Fork the process, refreshing kernel poller state in the child
    pub fn fork(&mut self) -> RtResult<i32> {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(RtError::Oom);
        }
        if pid == 0 {
            self.poller.reinit()?;
        }
        Ok(pid)
    }

    /// Give up the CPU until this fiber is runnable again
    ///
    /// The distributed run loop: pop the next ready fiber and switch
    /// into it, or poll the kernel when nothing is runnable. Returns
    /// once `me` has been popped (possibly without any switch, when it
    /// is the only runnable fiber).
    pub(crate) fn schedule_out(&mut self, me: FiberId) {
        loop {
            match self.ready.pop_front() {
                Some(next) if next == me => break,
                Some(next) => {
                    self.switch_to(me, next);
                    break;
                }
                None => self.poll_step(),
            }
        }
        self.block_mut(me).set_state(FiberState::Running);
    }

    fn switch_to(&mut self, me: FiberId, next: FiberId) {
        debug_assert_ne!(me, next);
        self.current = next;
        self.block_mut(next).set_state(FiberState::Running);
        let old = self.slots.block_ptr(me);
        let new = self.slots.block_ptr(next);
        self.clock.refresh();
        // All `self` borrows end before the switch; the next fiber
        // re-enters the runtime through its own TLS access.
        unsafe {
            arch::switch(&mut (*old).ctx, &(*new).ctx);
        }
        // Back on `me`; whoever resumed us already set `current`.
    }

    /// One tick of the idle loop: fire timers, then block in the kernel
    /// until fd readiness or the next deadline
    pub(crate) fn poll_step(&mut self) {
        let now = self.clock.refresh();

        let mut woke = false;
        while let Some(e) = self.timers.pop_expired(now) {
            let live = {
                let b = self.block(e.fiber);
                b.fiber_state() == FiberState::Blocked && b.wait_seq == e.seq
            };
            if live {
                self.wake_with(e.fiber, -1, Some(RtError::TimedOut));
                woke = true;
            }
        }
        if woke {
            return;
        }

        let timeout = match self.timers.next_deadline() {
            Some(d) => (d - now).clamp(0, i32::MAX as i64) as i32,
            None if self.poller.has_waiters() => -1,
            None => panic!(
                "deadlock: every fiber is blocked with no timer and no fd waiter \
                 ({} fibers live)",
                self.slots.live()
            ),
        };

        let mut events = std::mem::take(&mut self.fd_events);
        events.clear();
        if let Err(e) = self.poller.wait(timeout, &mut events) {
            kerror!("poller wait failed: {}", e);
        }
        self.clock.refresh();

        for ev in &events {
            // A fiber woken earlier in this same batch is no longer
            // Blocked; its remaining events are stale.
            if self.block(ev.fiber).fiber_state() != FiberState::Blocked {
                continue;
            }
            let cp = self.clause_ptr(ev.fiber, ev.clause);
            unsafe {
                (*cp).revents = ev.revents;
                (*cp).status = ev.status;
            }
            self.wake_with(ev.fiber, ev.clause as i32, ev.status);
        }
        self.fd_events = events;
    }

    /// Bookkeeping when a fiber returns from its entry
    fn on_finished(&mut self, me: FiberId) {
        let reaper = {
            let blk = self.block_mut(me);
            blk.set_state(FiberState::Finished);
            blk.reaper
        };
        ktrace!("fiber {} finished", me);

        if reaper == FIBER_NONE {
            return;
        }
        let rid = self.slots.live_handle(reaper);
        let (pending, state) = {
            let rb = self.block_mut(rid);
            debug_assert!(rb.reap_pending > 0);
            rb.reap_pending -= 1;
            (rb.reap_pending, rb.fiber_state())
        };
        if pending == 0 && state == FiberState::Blocked {
            // The canceller parks on a single reap clause
            let idx = {
                let rb = self.block(rid);
                debug_assert_eq!(rb.wait_len, 1);
                0
            };
            unsafe {
                (*self.clause_ptr(rid, idx)).status = None;
            }
            self.wake_with(rid, idx as i32, None);
        }
    }
}

// ── Launch plumbing ──────────────────────────────────────────────────

/// First frame of every fiber: unbox and run the user closure
extern "C" fn fiber_entry(arg: usize) {
    let f: Box<Box<dyn FnOnce()>> = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce()>) };
    // A panic must not unwind into the launch trampoline's assembly
    // frame.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || (*f)()));
    if outcome.is_err() {
        kerror!("fiber panicked; aborting");
        std::process::abort();
    }
}

/// Called by the launch trampoline when a fiber's entry returns
///
/// Marks the fiber Finished (its slot survives until the owner cancels
/// it) and hands the thread to the next runnable fiber. Never returns.
pub(crate) extern "C" fn fiber_finished() {
    let rt = rt();
    let me = rt.current;
    rt.on_finished(me);

    loop {
        if let Some(next) = rt.ready.pop_front() {
            rt.current = next;
            rt.block_mut(next).set_state(FiberState::Running);
            let dead = rt.slots.block_ptr(me);
            let new = rt.slots.block_ptr(next);
            rt.clock.refresh();
            unsafe {
                // The save half writes into the dead fiber's block; it
                // is never resumed, so the contents are irrelevant.
                arch::switch(&mut (*dead).ctx, &(*new).ctx);
            }
            unreachable!("finished fiber was resumed");
        }
        rt.poll_step();
    }
}

// ── Thread-local runtime ─────────────────────────────────────────────

struct RtCell(Cell<*mut Runtime>);

impl Drop for RtCell {
    fn drop(&mut self) {
        let p = self.0.get();
        if !p.is_null() {
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

thread_local! {
    static RUNTIME: RtCell = const { RtCell(Cell::new(std::ptr::null_mut())) };
}

/// Access this thread's runtime, creating it on first use
///
/// Handing out `&'static mut` is sound only because the runtime is
/// strictly single-threaded and cooperative: borrows never survive a
/// context switch, and the TLS cell is re-read after every resume.
pub(crate) fn rt() -> &'static mut Runtime {
    RUNTIME.with(|cell| {
        let mut p = cell.0.get();
        if p.is_null() {
            let runtime = Runtime::new(RuntimeConfig::from_env())
                .expect("failed to initialize fiber runtime");
            p = Box::into_raw(Box::new(runtime));
            cell.0.set(p);
        }
        unsafe { &mut *p }
    })
}

/// Explicitly initialize this thread's runtime
///
/// Fails `Busy` if one already exists (including implicitly, through an
/// earlier call into the public API).
pub fn init(config: RuntimeConfig) -> RtResult<()> {
    RUNTIME.with(|cell| {
        if !cell.0.get().is_null() {
            return Err(RtError::Busy);
        }
        let runtime = Runtime::new(config)?;
        cell.0.set(Box::into_raw(Box::new(runtime)));
        Ok(())
    })
}

// ── Free-function API over the thread-local runtime ──────────────────

/// Launch a fiber; see [`Runtime::spawn`]
pub fn spawn(f: Box<dyn FnOnce()>) -> RtResult<FiberId> {
    rt().spawn(f)
}

/// Requeue the current fiber and run someone else
pub fn yield_now() -> RtResult<()> {
    rt().yield_now()
}

/// Sleep until an absolute deadline in monotonic ms
pub fn msleep(deadline: i64) -> RtResult<()> {
    rt().msleep(deadline)
}

/// Cached monotonic clock in ms
pub fn now() -> i64 {
    rt().clock.now()
}

/// Wait for fd readiness
pub fn fd_wait(fd: RawFd, events: u32, deadline: i64) -> RtResult<u32> {
    rt().fd_wait(fd, events, deadline)
}

/// Forget poller state for an fd about to be closed
pub fn fd_clean(fd: RawFd) {
    rt().fd_clean(fd);
}

/// Cancel fibers; see [`Runtime::cancel`]
pub fn cancel(handles: &[FiberId], deadline: i64) -> RtResult<()> {
    rt().cancel(handles, deadline)
}

/// Select over channel clauses
pub fn choose(clauses: &mut [Clause], deadline: i64) -> RtResult<usize> {
    rt().choose(clauses, deadline)
}

/// Fork with poller reinit in the child
pub fn fork() -> RtResult<i32> {
    rt().fork()
}

/// Coroutine-local storage accessors
pub fn cls() -> usize {
    rt().cls()
}

pub fn set_cls(p: usize) {
    rt().set_cls(p)
}

/// Runtime occupancy snapshot
pub fn stats() -> RuntimeStats {
    rt().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test thread gets its own runtime via TLS, so these exercise
    // the scheduler end to end without cross-test interference.

    #[test]
    fn test_spawn_runs_at_tail() {
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        let h = spawn(Box::new(move || {
            o1.borrow_mut().push(2);
        }))
        .unwrap();
        order.borrow_mut().push(1);
        yield_now().unwrap();
        order.borrow_mut().push(3);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        cancel(&[h], -1).unwrap();
    }

    #[test]
    fn test_yield_round_robin() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let h1 = spawn(Box::new(move || {
            for _ in 0..3 {
                a.borrow_mut().push('a');
                yield_now().unwrap();
            }
        }))
        .unwrap();
        let h2 = spawn(Box::new(move || {
            for _ in 0..3 {
                b.borrow_mut().push('b');
                yield_now().unwrap();
            }
        }))
        .unwrap();
        // Let both run to completion
        for _ in 0..10 {
            yield_now().unwrap();
        }
        assert_eq!(*log.borrow(), vec!['a', 'b', 'a', 'b', 'a', 'b']);
        cancel(&[h1, h2], -1).unwrap();
    }

    #[test]
    fn test_msleep_waits() {
        let start = crate::clock::raw_now_ms();
        msleep(now() + 30).unwrap();
        let elapsed = crate::clock::raw_now_ms() - start;
        assert!(elapsed >= 30, "slept only {}ms", elapsed);
    }

    #[test]
    fn test_cancel_finished_fiber_is_immediate() {
        let h = spawn(Box::new(|| {})).unwrap();
        yield_now().unwrap(); // let it run to completion
        let before = now();
        cancel(&[h], before + 10_000).unwrap();
        assert!(now() - before < 1000);
    }

    #[test]
    fn test_cancel_invalid_handle() {
        assert_eq!(cancel(&[FiberId::NONE], -1), Err(RtError::BadArg));
    }

    #[test]
    fn test_stale_handle_rejected_after_reap() {
        let h = spawn(Box::new(|| {})).unwrap();
        yield_now().unwrap();
        cancel(&[h], -1).unwrap();

        // The slot is reaped; the retained handle must not validate
        assert_eq!(cancel(&[h], -1), Err(RtError::BadArg));

        // Even once the slot is recycled into an unrelated live fiber,
        // the stale handle must not reach it
        let h2 = spawn(Box::new(|| {
            msleep(now() + 10_000).ok();
        }))
        .unwrap();
        assert_eq!(h2.raw(), h.raw());
        assert_eq!(cancel(&[h], -1), Err(RtError::BadArg));

        cancel(&[h2], 0).unwrap();
    }

    #[test]
    fn test_sticky_cancel_observed_in_fiber() {
        let saw = std::rc::Rc::new(std::cell::Cell::new(false));
        let s = saw.clone();
        let h = spawn(Box::new(move || {
            // Sleep far in the future; the canceller aborts it
            let r = msleep(now() + 60_000);
            assert_eq!(r, Err(RtError::Canceled));
            // Every subsequent suspension point keeps failing
            assert_eq!(yield_now(), Err(RtError::Canceled));
            s.set(true);
        }))
        .unwrap();
        yield_now().unwrap(); // let it park
        cancel(&[h], 0).unwrap();
        assert!(saw.get());
    }

    #[test]
    fn test_cls_roundtrip() {
        set_cls(0xDEAD);
        assert_eq!(cls(), 0xDEAD);
        let h = spawn(Box::new(|| {
            // Fresh fiber starts with an empty slot
            assert_eq!(cls(), 0);
            set_cls(7);
            assert_eq!(cls(), 7);
        }))
        .unwrap();
        yield_now().unwrap();
        assert_eq!(cls(), 0xDEAD);
        cancel(&[h], -1).unwrap();
    }

    #[test]
    fn test_stats_counts_fibers() {
        let base = stats().fibers_live;
        let h = spawn(Box::new(|| {
            msleep(now() + 10_000).ok();
        }))
        .unwrap();
        assert_eq!(stats().fibers_live, base + 1);
        cancel(&[h], 0).unwrap();
        assert_eq!(stats().fibers_live, base);
    }
}
