//! `EpollPoller`: level-triggered epoll backend.

use std::os::unix::io::RawFd;
use std::time::Duration;

use evnet_core::Interest;
use nix::errno::Errno;
use tracing::debug;

use super::{timeout_ms, Poller, Readiness};
use crate::sys;

pub struct EpollPoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    /// Create an epoll instance that returns up to `capacity` events per
    /// wait.
    pub fn new(capacity: usize) -> Result<Self, Errno> {
        let epfd = sys::check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let capacity = capacity.clamp(1, libc::c_int::MAX as usize);
        debug!(epfd, capacity, "epoll created");
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
        })
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: to_epoll(interest),
            u64: fd as u64,
        };
        sys::check(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) }).map(|_| ())
    }
}

fn to_epoll(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    // EPOLLERR and EPOLLHUP are always reported; setting ERR is harmless.
    if interest.is_error() {
        bits |= libc::EPOLLERR as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> Interest {
    let mut mask = Interest::NONE;
    if bits & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        mask |= Interest::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        mask |= Interest::WRITE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        mask |= Interest::ERROR;
    }
    mask
}

impl Poller for EpollPoller {
    fn add_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn mod_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn del_interest(&mut self, fd: RawFd) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE)
    }

    fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize, Errno> {
        let n = sys::check(unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        })? as usize;

        out.reserve(n);
        for ev in &self.events[..n] {
            // Copy out of the packed struct before use.
            let bits = ev.events;
            let token = ev.u64;
            out.push(Readiness {
                fd: token as RawFd,
                mask: from_epoll(bits),
            });
        }
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys::close_fd(self.epfd);
        self.epfd = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_mapping() {
        assert_eq!(from_epoll(libc::EPOLLHUP as u32), Interest::READ);
        assert_eq!(from_epoll(libc::EPOLLERR as u32), Interest::ERROR);
        assert_eq!(
            from_epoll((libc::EPOLLIN | libc::EPOLLOUT) as u32),
            Interest::READ | Interest::WRITE
        );
        assert_eq!(to_epoll(Interest::NONE), 0);
        assert!(to_epoll(Interest::WRITE) & libc::EPOLLOUT as u32 != 0);
    }
}
