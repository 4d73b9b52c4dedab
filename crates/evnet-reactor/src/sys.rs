//! Thin syscall helpers shared by the pollers and sockets.
//!
//! Descriptors are plain `RawFd`s: ownership is tracked by the endpoint that
//! holds them, which closes the fd in its `Drop`.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::{debug, info};

/// errno of the last failed libc call.
#[inline]
pub(crate) fn last_errno() -> Errno {
    Errno::last()
}

/// Map a libc return code to `Result`.
#[inline]
pub(crate) fn check(ret: libc::c_int) -> Result<libc::c_int, Errno> {
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(ret)
    }
}

/// Transient errno values that mean "try again later".
#[inline]
pub(crate) fn is_transient(e: Errno) -> bool {
    matches!(e, Errno::EAGAIN | Errno::EINTR) || e == Errno::EWOULDBLOCK
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Close `fd`, ignoring errors. Negative fds are skipped.
pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Non-blocking, close-on-exec IPv4 socket of the given type.
pub(crate) fn new_socket(ty: libc::c_int) -> Result<RawFd, Errno> {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let fd = check(unsafe {
        libc::socket(libc::AF_INET, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    })?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let fd = {
        let fd = check(unsafe { libc::socket(libc::AF_INET, ty, 0) })?;
        let setup = set_nonblocking(fd)
            .and_then(|_| set_cloexec(fd))
            .and_then(|_| setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1));
        if let Err(e) = setup {
            close_fd(fd);
            return Err(e);
        }
        fd
    };

    Ok(fd)
}

/// Make a descriptor handed out by the kernel (`accept`) non-blocking and
/// close-on-exec.
pub(crate) fn prepare_accepted(fd: RawFd) -> Result<(), Errno> {
    set_nonblocking(fd)?;
    set_cloexec(fd)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
    Ok(())
}

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> Result<(), Errno> {
    check(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

pub(crate) fn getsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int, Errno> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    check(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(value)
}

/// Pending error on the socket (`SO_ERROR`), cleared by reading it.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<Option<Errno>, Errno> {
    match getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)? {
        0 => Ok(None),
        code => Ok(Some(Errno::from_raw(code))),
    }
}

/// Enable keepalive with the given probe timing.
pub(crate) fn enable_keepalive(fd: RawFd, idle: u32, interval: u32, count: u32) -> Result<(), Errno> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "macos", target_os = "ios"))] {
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, idle as libc::c_int)?;
        } else {
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle as libc::c_int)?;
        }
    }
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval as libc::c_int)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count as libc::c_int)?;
    Ok(())
}

// ── data transfer ──

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
// SO_NOSIGPIPE is set on the socket instead.
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(last_errno());
    }
    Ok(n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) };
    if n < 0 {
        return Err(last_errno());
    }
    Ok(n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), Errno> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = sockaddr_len();
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut sa as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(last_errno());
    }
    Ok((n as usize, from_sockaddr(&sa)))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], to: &SocketAddrV4) -> Result<usize, Errno> {
    let sa = to_sockaddr(to);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
            &sa as *const _ as *const libc::sockaddr,
            sockaddr_len(),
        )
    };
    if n < 0 {
        return Err(last_errno());
    }
    Ok(n as usize)
}

// ── socket addresses ──

pub(crate) fn to_sockaddr(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd",
              target_os = "dragonfly", target_os = "openbsd"))]
    {
        sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa
}

pub(crate) fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

#[inline]
pub(crate) fn sockaddr_len() -> libc::socklen_t {
    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddrV4) -> Result<(), Errno> {
    let sa = to_sockaddr(addr);
    check(unsafe { libc::bind(fd, &sa as *const _ as *const libc::sockaddr, sockaddr_len()) })
        .map(|_| ())
}

/// Locally bound address of `fd`.
pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddrV4, Errno> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = sockaddr_len();
    check(unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(from_sockaddr(&sa))
}

// ── descriptor limit ──

/// Raise the `RLIMIT_NOFILE` soft limit to `wanted` if it is lower.
///
/// The hard limit is only touched when it is itself below `wanted`, which
/// needs privilege.
pub(crate) fn raise_nofile_limit(wanted: u64) -> Result<(), Errno> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let (soft, hard) = (soft as u64, hard as u64);
    if soft >= wanted {
        debug!(soft, hard, wanted, "descriptor limit already sufficient");
        return Ok(());
    }
    let new_hard = hard.max(wanted);
    setrlimit(
        Resource::RLIMIT_NOFILE,
        wanted as libc::rlim_t,
        new_hard as libc::rlim_t,
    )?;
    info!(old_soft = soft, old_hard = hard, soft = wanted, hard = new_hard, "raised descriptor limit");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4242);
        let sa = to_sockaddr(&addr);
        assert_eq!(u16::from_be(sa.sin_port), 4242);
        assert_eq!(from_sockaddr(&sa), addr);
    }

    #[test]
    fn test_new_socket_is_nonblocking() {
        let fd = new_socket(libc::SOCK_STREAM).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
        close_fd(fd);
    }

    #[test]
    #[serial]
    fn test_nofile_limit_noop_when_sufficient() {
        let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        raise_nofile_limit(soft as u64).unwrap();
        let (after, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(after, soft);
    }

    #[test]
    #[serial]
    fn test_nofile_limit_raised_toward_hard() {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let target = (hard as u64).min(4096);
        let lowered = target / 2;
        setrlimit(Resource::RLIMIT_NOFILE, lowered as libc::rlim_t, hard).unwrap();

        let raised = raise_nofile_limit(target);
        let after = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

        raised.unwrap();
        assert_eq!(after.0 as u64, target);
        assert_eq!(after.1, hard);
    }

    #[test]
    fn test_transient_errno() {
        assert!(is_transient(Errno::EAGAIN));
        assert!(is_transient(Errno::EINTR));
        assert!(!is_transient(Errno::ECONNRESET));
    }
}
