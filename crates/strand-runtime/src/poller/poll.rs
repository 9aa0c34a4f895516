//! poll(2) backend for non-Linux Unix
//!
//! Stateless: the pollfd array is rebuilt from the armed set on every
//! cycle, so registration updates and post-fork reinit are no-ops.

use std::os::unix::io::RawFd;

use super::{EV_IN, EV_OUT};
use strand_core::{RtError, RtResult};

pub struct Backend;

impl Backend {
    pub fn new() -> RtResult<Self> {
        Ok(Self)
    }

    pub fn update(&mut self, _fd: RawFd, _old: u32, _new: u32) -> RtResult<()> {
        Ok(())
    }

    /// One poll(2) cycle over the armed set
    pub fn wait(
        &mut self,
        timeout_ms: i32,
        armed: &[(RawFd, u32)],
        out: &mut Vec<(RawFd, u32, bool)>,
    ) -> RtResult<()> {
        let mut pfds: Vec<libc::pollfd> = armed
            .iter()
            .map(|&(fd, events)| {
                let mut ev: libc::c_short = 0;
                if events & EV_IN != 0 {
                    ev |= libc::POLLIN;
                }
                if events & EV_OUT != 0 {
                    ev |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events: ev,
                    revents: 0,
                }
            })
            .collect();

        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(RtError::BadFd);
        }

        for pfd in &pfds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                out.push((pfd.fd, 0, true));
                continue;
            }
            let mut bits = 0;
            if pfd.revents & libc::POLLIN != 0 {
                bits |= EV_IN;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                bits |= EV_OUT;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                bits |= EV_IN | EV_OUT;
            }
            out.push((pfd.fd, bits, false));
        }
        Ok(())
    }

    pub fn reinit(&mut self, _armed: &[(RawFd, u32)]) -> RtResult<()> {
        Ok(())
    }
}
