//! epoll backend (Linux), level-triggered

use std::os::unix::io::RawFd;

use super::{EV_IN, EV_OUT};
use strand_core::{RtError, RtResult};

const MAX_EVENTS: usize = 64;

pub struct Backend {
    epfd: RawFd,
}

impl Backend {
    pub fn new() -> RtResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::Oom);
        }
        Ok(Self { epfd })
    }

    /// Reconcile the kernel registration of `fd` from `old` to `new` bits
    pub fn update(&mut self, fd: RawFd, old: u32, new: u32) -> RtResult<()> {
        let op = match (old != 0, new != 0) {
            (false, false) => return Ok(()),
            (false, true) => libc::EPOLL_CTL_ADD,
            (true, true) => libc::EPOLL_CTL_MOD,
            (true, false) => libc::EPOLL_CTL_DEL,
        };

        let mut ev = libc::epoll_event {
            events: to_epoll_events(new),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // The fd may already be gone when deregistering
            if op == libc::EPOLL_CTL_DEL && (errno == libc::ENOENT || errno == libc::EBADF) {
                return Ok(());
            }
            return Err(RtError::BadFd);
        }
        Ok(())
    }

    /// One epoll_wait cycle; events land as (fd, EV_* bits, invalid)
    pub fn wait(
        &mut self,
        timeout_ms: i32,
        out: &mut Vec<(RawFd, u32, bool)>,
    ) -> RtResult<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(()); // EINTR: retry next cycle
            }
            return Err(RtError::BadFd);
        }

        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            let mut bits = 0;
            if ev.events & libc::EPOLLIN as u32 != 0 {
                bits |= EV_IN;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                bits |= EV_OUT;
            }
            // Errors and hangups wake every waiter on the fd; the actual
            // failure surfaces from the subsequent read/write.
            if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                bits |= EV_IN | EV_OUT;
            }
            out.push((fd, bits, false));
        }
        Ok(())
    }

    /// Replace the epoll instance after fork and re-register `armed`
    pub fn reinit(&mut self, armed: &[(RawFd, u32)]) -> RtResult<()> {
        unsafe { libc::close(self.epfd) };
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::Oom);
        }
        self.epfd = epfd;
        for &(fd, events) in armed {
            self.update(fd, 0, events)?;
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn to_epoll_events(events: u32) -> u32 {
    let mut ev = 0;
    if events & EV_IN != 0 {
        ev |= libc::EPOLLIN as u32;
    }
    if events & EV_OUT != 0 {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}
