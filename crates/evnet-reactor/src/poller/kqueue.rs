//! `KqueuePoller`: kqueue backend for macOS and the BSDs.
//!
//! kqueue keeps one filter per (fd, direction), so an interest mask maps to
//! up to two kevents and a readiness pass can report the same fd twice.
//! `wait()` merges those back into one `Readiness` per fd.
//!
//! kqueue has no separate error filter: `EV_ERROR` on a returned event, or a
//! nonzero `fflags` with `EV_EOF`, is reported as ERROR.

use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use evnet_core::Interest;
use nix::errno::Errno;
use tracing::debug;

use super::{Poller, Readiness};
use crate::sys;

pub struct KqueuePoller {
    kq: RawFd,
    events: Vec<libc::kevent>,
    /// Interest currently installed per fd.
    registered: HashMap<RawFd, Interest>,
}

impl KqueuePoller {
    pub fn new(capacity: usize) -> Result<Self, Errno> {
        let kq = sys::check(unsafe { libc::kqueue() })?;
        if let Err(e) = sys::set_cloexec(kq) {
            sys::close_fd(kq);
            return Err(e);
        }
        let capacity = capacity.clamp(1, libc::c_int::MAX as usize);
        debug!(kq, capacity, "kqueue created");
        Ok(Self {
            kq,
            events: vec![unsafe { mem::zeroed() }; capacity],
            registered: HashMap::new(),
        })
    }

    /// Move the filters of `fd` from `from` to `to`. A failed step undoes
    /// the steps before it, so the kernel is left at `from`.
    fn apply(&mut self, fd: RawFd, from: Interest, to: Interest) -> Result<(), Errno> {
        let kq = self.kq;
        apply_steps(&filter_steps(from, to), |filter, add| kevent_change(kq, fd, filter, add))
    }
}

/// Filters whose registration differs between `from` and `to`, as
/// `(filter, add)` pairs.
fn filter_steps(from: Interest, to: Interest) -> Vec<(i32, bool)> {
    let mut steps = Vec::with_capacity(2);
    for (had, wants, filter) in [
        (from.is_readable(), to.is_readable(), libc::EVFILT_READ as i32),
        (from.is_writable(), to.is_writable(), libc::EVFILT_WRITE as i32),
    ] {
        if had != wants {
            steps.push((filter, wants));
        }
    }
    steps
}

fn apply_steps(
    steps: &[(i32, bool)],
    mut change: impl FnMut(i32, bool) -> Result<(), Errno>,
) -> Result<(), Errno> {
    for (i, &(filter, add)) in steps.iter().enumerate() {
        if let Err(e) = change(filter, add) {
            for &(done, added) in steps[..i].iter().rev() {
                if let Err(undo) = change(done, !added) {
                    debug!(filter = done, error = %undo, "kevent rollback failed");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn kevent_change(kq: RawFd, fd: RawFd, filter: i32, add: bool) -> Result<(), Errno> {
    let flags = if add { libc::EV_ADD | libc::EV_ENABLE } else { libc::EV_DELETE };
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as _;
    kev.filter = filter as _;
    kev.flags = flags as _;
    kev.udata = fd as usize as _;
    match sys::check(unsafe { libc::kevent(kq, &kev, 1, ptr::null_mut(), 0, ptr::null()) }) {
        Ok(_) => Ok(()),
        Err(Errno::ENOENT) if !add => Ok(()),
        Err(e) => Err(e),
    }
}

impl Poller for KqueuePoller {
    fn add_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        if self.registered.contains_key(&fd) {
            return Err(Errno::EEXIST);
        }
        self.apply(fd, Interest::NONE, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn mod_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        let current = *self.registered.get(&fd).ok_or(Errno::ENOENT)?;
        self.apply(fd, current, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn del_interest(&mut self, fd: RawFd) -> Result<(), Errno> {
        let current = self.registered.remove(&fd).ok_or(Errno::ENOENT)?;
        self.apply(fd, current, Interest::NONE)
    }

    fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize, Errno> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = sys::check(unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                ts_ptr,
            )
        })? as usize;

        let start = out.len();
        for kev in &self.events[..n] {
            let fd = kev.ident as RawFd;
            let flags = kev.flags as u32;
            let filter = kev.filter as i32;
            let mut mask = Interest::NONE;
            if flags & libc::EV_ERROR as u32 != 0 {
                mask |= Interest::ERROR;
            } else if filter == libc::EVFILT_READ as i32 {
                mask |= Interest::READ;
            } else if filter == libc::EVFILT_WRITE as i32 {
                mask |= Interest::WRITE;
            }
            if flags & libc::EV_EOF as u32 != 0 && kev.fflags != 0 {
                mask |= Interest::ERROR;
            }
            out.push(Readiness { fd, mask });
        }

        // One entry per fd.
        let merged = &mut out[start..];
        merged.sort_unstable_by_key(|r| r.fd);
        let mut write = start;
        for read in start..out.len() {
            if write > start && out[write - 1].fd == out[read].fd {
                let extra = out[read].mask;
                out[write - 1].mask |= extra;
            } else {
                out[write] = out[read];
                write += 1;
            }
        }
        out.truncate(write);
        Ok(write - start)
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        sys::close_fd(self.kq);
        self.kq = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const READ: i32 = libc::EVFILT_READ as i32;
    const WRITE: i32 = libc::EVFILT_WRITE as i32;

    #[test]
    fn test_filter_steps_only_touch_changes() {
        assert_eq!(filter_steps(Interest::NONE, Interest::ALL), vec![(READ, true), (WRITE, true)]);
        assert_eq!(filter_steps(Interest::ALL, Interest::READ_ERROR), vec![(WRITE, false)]);
        assert_eq!(filter_steps(Interest::READ_ERROR, Interest::READ), vec![]);
        assert_eq!(filter_steps(Interest::READ_ERROR, Interest::NONE), vec![(READ, false)]);
    }

    #[test]
    fn test_failed_write_filter_rolls_back_read() {
        let calls = RefCell::new(Vec::new());
        let err = apply_steps(&filter_steps(Interest::NONE, Interest::ALL), |filter, add| {
            calls.borrow_mut().push((filter, add));
            if filter == WRITE && add {
                Err(Errno::ENOMEM)
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err, Errno::ENOMEM);
        assert_eq!(*calls.borrow(), vec![(READ, true), (WRITE, true), (READ, false)]);
    }

    #[test]
    fn test_failed_add_leaves_fd_unregistered() {
        let mut poller = KqueuePoller::new(8).unwrap();
        // Not an open descriptor: every kevent change fails.
        let fd = 1_000_000;
        assert!(poller.add_interest(fd, Interest::ALL).is_err());
        assert!(!poller.registered.contains_key(&fd));
        assert_eq!(poller.mod_interest(fd, Interest::READ), Err(Errno::ENOENT));
    }
}
