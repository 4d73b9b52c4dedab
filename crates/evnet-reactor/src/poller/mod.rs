//! Kernel readiness backends.
//!
//! The reactor only talks to the [`Poller`] trait. The backend is chosen at
//! compile time through [`DefaultPoller`] and can be swapped at startup with
//! `Reactor::with_poller`.
//!
//! ```text
//!   Reactor ──► Box<dyn Poller>
//!                  ├─ EpollPoller   (linux, android)
//!                  └─ KqueuePoller  (macos, ios, *bsd)
//! ```
//!
//! Backends report readiness already folded into an [`Interest`] mask:
//! hang-up counts as READ (the following read sees EOF) and kernel error
//! conditions as ERROR.

use std::os::unix::io::RawFd;
use std::time::Duration;

use evnet_core::Interest;
use nix::errno::Errno;

/// One ready descriptor from a `wait()` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub mask: Interest,
}

/// Readiness multiplexer over raw descriptors.
pub trait Poller {
    /// Start watching `fd` for `interest`.
    fn add_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno>;

    /// Replace the interest set of an already watched `fd`.
    fn mod_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno>;

    /// Stop watching `fd`.
    fn del_interest(&mut self, fd: RawFd) -> Result<(), Errno>;

    /// Block up to `timeout` (forever if `None`) and append ready
    /// descriptors to `out`. Each fd appears at most once per call.
    fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize, Errno>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::EpollPoller;
        pub use epoll::EpollPoller as DefaultPoller;
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd",
                        target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))] {
        mod kqueue;
        pub use kqueue::KqueuePoller;
        pub use kqueue::KqueuePoller as DefaultPoller;
    } else {
        compile_error!("Unsupported platform: evnet needs epoll or kqueue");
    }
}

/// Create the platform poller sized for `capacity` events per wait.
pub fn new_poller(capacity: usize) -> Result<Box<dyn Poller>, Errno> {
    Ok(Box::new(DefaultPoller::new(capacity)?))
}

/// Millisecond timeout for poll-style syscalls, rounding sub-millisecond
/// durations up so a short wait never turns into a busy spin.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if ms == 0 && !d.is_zero() {
                ms = 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
