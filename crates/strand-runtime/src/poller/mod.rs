//! File-descriptor readiness
//!
//! The poller owns a cache of fd entries with at most one parked fiber
//! per (fd, direction). Backends translate to the kernel primitive:
//! epoll on Linux, poll(2) elsewhere on Unix. Level-triggered semantics
//! throughout; the kernel registration for a direction exists exactly
//! while a waiter occupies its slot.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        use epoll::Backend;
    } else if #[cfg(unix)] {
        mod poll;
        use poll::Backend;
    } else {
        compile_error!("Unsupported platform");
    }
}

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use strand_core::{FiberId, RtError, RtResult};

/// Readiness bit: fd readable
pub const EV_IN: u32 = 1;
/// Readiness bit: fd writable
pub const EV_OUT: u32 = 2;

/// A readiness delivery for a parked fiber
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    pub fiber: FiberId,
    pub clause: usize,
    /// Subset of EV_IN|EV_OUT that fired
    pub revents: u32,
    /// Set when the kernel reported the fd itself as invalid
    pub status: Option<RtError>,
}

/// Cache entry for one file descriptor
#[derive(Default)]
struct FdEntry {
    in_waiter: Option<(FiberId, usize)>,
    out_waiter: Option<(FiberId, usize)>,
}

impl FdEntry {
    fn armed(&self) -> u32 {
        let mut ev = 0;
        if self.in_waiter.is_some() {
            ev |= EV_IN;
        }
        if self.out_waiter.is_some() {
            ev |= EV_OUT;
        }
        ev
    }
}

/// Poller: fd cache plus kernel backend
pub struct Poller {
    backend: Backend,
    fds: HashMap<RawFd, FdEntry>,
}

impl Poller {
    pub fn new() -> RtResult<Self> {
        Ok(Self {
            backend: Backend::new()?,
            fds: HashMap::new(),
        })
    }

    /// Any fiber parked on any fd?
    pub fn has_waiters(&self) -> bool {
        self.fds.values().any(|e| e.armed() != 0)
    }

    /// Non-blocking readiness check, independent of the cache
    ///
    /// Used by the wait engine's probe phase; a plain poll(2) with zero
    /// timeout works on every Unix regardless of backend.
    pub fn probe(&self, fd: RawFd, events: u32) -> RtResult<u32> {
        let mut pfd = libc::pollfd {
            fd,
            events: to_poll_events(events),
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(RtError::BadFd);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(RtError::BadFd);
        }
        Ok(from_poll_revents(pfd.revents, events))
    }

    /// Park a fiber clause on `fd` for `events`
    ///
    /// Fails `Busy` if any requested direction already has a waiter, and
    /// `BadFd` if the kernel rejects the descriptor.
    pub fn arm(
        &mut self,
        fd: RawFd,
        events: u32,
        fiber: FiberId,
        clause: usize,
    ) -> RtResult<()> {
        if fd < 0 || events & (EV_IN | EV_OUT) == 0 {
            return Err(RtError::BadArg);
        }

        let entry = self.fds.entry(fd).or_default();
        if events & EV_IN != 0 && entry.in_waiter.is_some() {
            return Err(RtError::Busy);
        }
        if events & EV_OUT != 0 && entry.out_waiter.is_some() {
            return Err(RtError::Busy);
        }

        let old = entry.armed();
        if events & EV_IN != 0 {
            entry.in_waiter = Some((fiber, clause));
        }
        if events & EV_OUT != 0 {
            entry.out_waiter = Some((fiber, clause));
        }
        let new = entry.armed();

        if let Err(e) = self.backend.update(fd, old, new) {
            // Roll the slots back so a failed arm leaves no trace
            let entry = self.fds.get_mut(&fd).expect("entry vanished");
            if events & EV_IN != 0 {
                entry.in_waiter = None;
            }
            if events & EV_OUT != 0 {
                entry.out_waiter = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove `fiber`'s waiter slots on `fd` for the given directions
    ///
    /// Idempotent; slots held by other fibers are untouched.
    pub fn disarm(&mut self, fd: RawFd, events: u32, fiber: FiberId) {
        let Some(entry) = self.fds.get_mut(&fd) else {
            return;
        };
        let old = entry.armed();
        if events & EV_IN != 0 {
            if let Some((f, _)) = entry.in_waiter {
                if f == fiber {
                    entry.in_waiter = None;
                }
            }
        }
        if events & EV_OUT != 0 {
            if let Some((f, _)) = entry.out_waiter {
                if f == fiber {
                    entry.out_waiter = None;
                }
            }
        }
        let new = entry.armed();
        if new != old {
            // Dropping a kernel registration cannot meaningfully fail here
            let _ = self.backend.update(fd, old, new);
        }
    }

    /// Forget everything about `fd`
    ///
    /// Must be called before the application closes the descriptor.
    pub fn clean(&mut self, fd: RawFd) {
        if let Some(entry) = self.fds.remove(&fd) {
            debug_assert!(
                entry.armed() == 0,
                "fdclean({}) with parked waiters",
                fd
            );
            if entry.armed() != 0 {
                let _ = self.backend.update(fd, entry.armed(), 0);
            }
        }
    }

    /// Block up to `timeout_ms` (-1 = forever) and collect deliveries
    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<FdEvent>) -> RtResult<()> {
        let mut raw: Vec<(RawFd, u32, bool)> = Vec::new();

        #[cfg(target_os = "linux")]
        self.backend.wait(timeout_ms, &mut raw)?;

        #[cfg(not(target_os = "linux"))]
        {
            let armed: Vec<(RawFd, u32)> = self
                .fds
                .iter()
                .filter(|(_, e)| e.armed() != 0)
                .map(|(&fd, e)| (fd, e.armed()))
                .collect();
            self.backend.wait(timeout_ms, &armed, &mut raw)?;
        }

        for (fd, bits, invalid) in raw {
            let Some(entry) = self.fds.get(&fd) else {
                continue;
            };
            let status = if invalid { Some(RtError::BadFd) } else { None };

            match (entry.in_waiter, entry.out_waiter) {
                (Some(iw), Some(ow)) if iw == ow => {
                    if bits & (EV_IN | EV_OUT) != 0 {
                        out.push(FdEvent {
                            fiber: iw.0,
                            clause: iw.1,
                            revents: bits & (EV_IN | EV_OUT),
                            status,
                        });
                    }
                }
                (in_w, out_w) => {
                    if bits & EV_IN != 0 {
                        if let Some((fiber, clause)) = in_w {
                            out.push(FdEvent {
                                fiber,
                                clause,
                                revents: EV_IN,
                                status,
                            });
                        }
                    }
                    if bits & EV_OUT != 0 {
                        if let Some((fiber, clause)) = out_w {
                            out.push(FdEvent {
                                fiber,
                                clause,
                                revents: EV_OUT,
                                status,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard kernel polling state and rebuild it (post-fork)
    ///
    /// The fd cache survives; every armed direction is re-registered
    /// against a fresh kernel handle.
    pub fn reinit(&mut self) -> RtResult<()> {
        let armed: Vec<(RawFd, u32)> = self
            .fds
            .iter()
            .filter(|(_, e)| e.armed() != 0)
            .map(|(&fd, e)| (fd, e.armed()))
            .collect();
        self.backend.reinit(&armed)
    }
}

/// EV_* bits to poll(2) event mask
fn to_poll_events(events: u32) -> libc::c_short {
    let mut ev: libc::c_short = 0;
    if events & EV_IN != 0 {
        ev |= libc::POLLIN;
    }
    if events & EV_OUT != 0 {
        ev |= libc::POLLOUT;
    }
    ev
}

/// poll(2) revents to EV_* bits, clamped to what was requested
///
/// Error and hangup conditions report every requested direction as
/// ready; the subsequent I/O call surfaces the real failure.
fn from_poll_revents(revents: libc::c_short, requested: u32) -> u32 {
    let mut ev = 0;
    if revents & libc::POLLIN != 0 {
        ev |= EV_IN;
    }
    if revents & libc::POLLOUT != 0 {
        ev |= EV_OUT;
    }
    if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        ev |= EV_IN | EV_OUT;
    }
    ev & requested
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe2() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_probe_pipe_readiness() {
        let (r, w) = pipe2();
        let poller = Poller::new().unwrap();

        // Empty pipe: read end not ready, write end ready
        assert_eq!(poller.probe(r, EV_IN).unwrap(), 0);
        assert_eq!(poller.probe(w, EV_OUT).unwrap(), EV_OUT);

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(poller.probe(r, EV_IN).unwrap(), EV_IN);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_single_waiter_per_direction() {
        let (r, w) = pipe2();
        let mut poller = Poller::new().unwrap();

        poller.arm(r, EV_IN, FiberId::from_parts(1, 0), 0).unwrap();
        assert_eq!(
            poller.arm(r, EV_IN, FiberId::from_parts(2, 0), 0),
            Err(RtError::Busy)
        );
        // The other direction is still free
        poller.arm(r, EV_OUT, FiberId::from_parts(2, 0), 0).unwrap();

        poller.disarm(r, EV_IN | EV_OUT, FiberId::from_parts(1, 0));
        // Fiber 2's slot survives a disarm for fiber 1
        assert_eq!(
            poller.arm(r, EV_OUT, FiberId::from_parts(3, 0), 0),
            Err(RtError::Busy)
        );
        poller.disarm(r, EV_OUT, FiberId::from_parts(2, 0));
        poller.clean(r);
        poller.clean(w);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_wait_delivers_readable() {
        let (r, w) = pipe2();
        let mut poller = Poller::new().unwrap();

        poller.arm(r, EV_IN, FiberId::from_parts(7, 0), 3).unwrap();
        unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) };

        let mut events = Vec::new();
        poller.wait(100, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fiber, FiberId::from_parts(7, 0));
        assert_eq!(events[0].clause, 3);
        assert_eq!(events[0].revents, EV_IN);
        assert!(events[0].status.is_none());

        poller.disarm(r, EV_IN, FiberId::from_parts(7, 0));
        poller.clean(r);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_wait_timeout_no_events() {
        let mut poller = Poller::new().unwrap();
        let mut events = Vec::new();
        poller.wait(1, &mut events).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_bad_fd_rejected() {
        let mut poller = Poller::new().unwrap();
        assert_eq!(
            poller.arm(-1, EV_IN, FiberId::from_parts(1, 0), 0),
            Err(RtError::BadArg)
        );
    }
}
