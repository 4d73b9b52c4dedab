//! UDP endpoint: one datagram per readiness event, direct `sendto` on send.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

use evnet_core::{ElasticBuffer, Interest};
use tracing::{debug, error, info, trace, warn};

use super::{deliver, Endpoint, PacketHandler, SocketId, SocketMeta, SocketState, SocketType};
use crate::error::{NetError, Result};
use crate::reactor::Reactor;
use crate::sys;

pub struct UdpSocket {
    meta: SocketMeta,
    input: ElasticBuffer,
    handler: Rc<dyn PacketHandler>,
    notified: bool,
}

impl UdpSocket {
    fn new(fd: RawFd, state: SocketState, handler: Rc<dyn PacketHandler>) -> Self {
        Self {
            meta: SocketMeta::new(fd, SocketType::Udp, state),
            input: ElasticBuffer::new(),
            handler,
            notified: false,
        }
    }

    /// Bind `0.0.0.0:port` and accept datagrams from anyone.
    pub fn listen(reactor: &mut Reactor, port: u16, handler: Rc<dyn PacketHandler>) -> Result<SocketId> {
        Self::listen_on(reactor, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), handler)
    }

    /// Bind `addr`. Replies from the handler go to the sender of the
    /// datagram being handled.
    pub fn listen_on(reactor: &mut Reactor, addr: SocketAddrV4, handler: Rc<dyn PacketHandler>) -> Result<SocketId> {
        let span = reactor.span().clone();
        let _enter = span.enter();

        let fd = sys::new_socket(libc::SOCK_DGRAM)?;
        let mut sock = Box::new(Self::new(fd, SocketState::Listening, handler));
        set_buffer_sizes(fd, reactor.config().udp_buffer_size);
        let bound = sys::setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .and_then(|_| sys::bind(fd, &addr));
        if let Err(e) = bound {
            error!(%addr, error = %e, "udp bind failed");
            return Err(NetError::Os(e));
        }
        sock.meta.local_addr = sys::local_addr(fd).ok();
        let local = sock.meta.local_addr.unwrap_or(addr);

        let id = reactor.add_socket(sock, Interest::READ_ERROR)?;
        info!(fd, addr = %local, "udp listening");
        Ok(id)
    }

    /// Socket with a fixed peer; `send_packet` goes to `ip:port`.
    ///
    /// The socket is bound to an ephemeral port so the peer's replies reach
    /// the handler.
    pub fn connect(
        reactor: &mut Reactor,
        ip: Ipv4Addr,
        port: u16,
        handler: Rc<dyn PacketHandler>,
    ) -> Result<SocketId> {
        let span = reactor.span().clone();
        let _enter = span.enter();

        let peer = SocketAddrV4::new(ip, port);
        let fd = sys::new_socket(libc::SOCK_DGRAM)?;
        let mut sock = Box::new(Self::new(fd, SocketState::Connected, handler));
        set_buffer_sizes(fd, reactor.config().udp_buffer_size);
        if let Err(e) = sys::bind(fd, &SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)) {
            error!(%peer, error = %e, "udp bind failed");
            return Err(NetError::Os(e));
        }
        sock.meta.peer_addr = Some(peer);
        sock.meta.local_addr = sys::local_addr(fd).ok();

        let id = reactor.add_socket(sock, Interest::READ_ERROR)?;
        debug!(fd, %peer, "udp peer set");
        Ok(id)
    }

    fn notify_closed(&mut self) {
        if !self.notified {
            self.notified = true;
            self.meta.state = SocketState::Closing;
            self.handler.handle_close(&self.meta);
        }
    }
}

/// Ask for large kernel buffers; privileged `*BUFFORCE` first on Linux.
fn set_buffer_sizes(fd: RawFd, size: usize) {
    let size = size as libc::c_int;
    for (forced, plain, name) in [
        (force_opt(libc::SO_RCVBUF), libc::SO_RCVBUF, "SO_RCVBUF"),
        (force_opt(libc::SO_SNDBUF), libc::SO_SNDBUF, "SO_SNDBUF"),
    ] {
        if let Some(opt) = forced {
            if sys::setsockopt_int(fd, libc::SOL_SOCKET, opt, size).is_ok() {
                continue;
            }
        }
        if let Err(e) = sys::setsockopt_int(fd, libc::SOL_SOCKET, plain, size) {
            warn!(fd, option = name, size, error = %e, "udp buffer size not applied");
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn force_opt(opt: libc::c_int) -> Option<libc::c_int> {
    match opt {
        libc::SO_RCVBUF => Some(libc::SO_RCVBUFFORCE),
        libc::SO_SNDBUF => Some(libc::SO_SNDBUFFORCE),
        _ => None,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn force_opt(_opt: libc::c_int) -> Option<libc::c_int> {
    None
}

impl Endpoint for UdpSocket {
    fn meta(&self) -> &SocketMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SocketMeta {
        &mut self.meta
    }

    fn handle_read(&mut self, reactor: &mut Reactor) {
        if self.meta.state == SocketState::Closing {
            return;
        }
        let mut scratch = reactor.take_scratch();
        let received = sys::recv_from(self.meta.fd, &mut scratch);
        let (n, from) = match received {
            Ok(got) => got,
            Err(e) => {
                reactor.return_scratch(scratch);
                if !sys::is_transient(e) {
                    warn!(fd = self.meta.fd, error = %e, "recvfrom failed");
                    self.close(reactor);
                }
                return;
            }
        };
        if n == 0 {
            reactor.return_scratch(scratch);
            trace!(fd = self.meta.fd, %from, "empty datagram ignored");
            return;
        }
        let appended = self.input.append(&scratch[..n]);
        reactor.return_scratch(scratch);
        if let Err(e) = appended {
            error!(fd = self.meta.fd, error = %e, "datagram dropped");
            return;
        }

        if self.meta.state == SocketState::Listening {
            self.meta.peer_addr = Some(from);
        }
        self.meta.touch();
        trace!(fd = self.meta.fd, bytes = n, %from, "datagram");

        let mut input = mem::take(&mut self.input);
        let handler = Rc::clone(&self.handler);
        let accepted = deliver(self, &mut input, handler.as_ref(), reactor);
        // Datagrams do not carry over into the next read.
        input.clear();
        self.input = input;
        if !accepted {
            self.close(reactor);
        }
    }

    fn handle_write(&mut self, _reactor: &mut Reactor) {
        debug!(fd = self.meta.fd, "udp write readiness ignored");
    }

    fn handle_error(&mut self, reactor: &mut Reactor) {
        let cause = sys::take_socket_error(self.meta.fd).ok().flatten();
        match cause {
            Some(e) => warn!(fd = self.meta.fd, error = %e, "udp socket error"),
            None => warn!(fd = self.meta.fd, "udp socket error"),
        }
        self.close(reactor);
    }

    fn handle_timeout(&mut self, reactor: &mut Reactor, now: Instant) {
        if self.meta.state == SocketState::Connected && self.meta.is_idle(now) {
            info!(fd = self.meta.fd, "udp idle timeout");
            self.close(reactor);
        }
    }

    fn send_packet(&mut self, _reactor: &mut Reactor, data: &[u8]) -> Result<()> {
        if self.meta.state == SocketState::Closing {
            return Err(NetError::InvalidState(self.meta.state));
        }
        let peer = self.meta.peer_addr.ok_or(NetError::NoPeer)?;
        let sent = sys::send_to(self.meta.fd, data, &peer).map_err(|e| {
            debug!(fd = self.meta.fd, %peer, error = %e, "sendto failed");
            NetError::Os(e)
        })?;
        if sent != data.len() || sent == 0 {
            return Err(NetError::ShortSend { sent, len: data.len() });
        }
        self.meta.touch();
        Ok(())
    }

    fn close(&mut self, reactor: &mut Reactor) {
        if self.notified {
            return;
        }
        let id = self.meta.id();
        self.meta.state = SocketState::Closing;
        reactor.del_socket(id);
        debug!(fd = id.fd, "udp closing");
        self.notify_closed();
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        if self.meta.generation != 0 {
            self.notify_closed();
        }
        sys::close_fd(self.meta.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use crate::socket::Session;
    use std::cell::RefCell;
    use std::time::Duration;

    /// Answers every datagram with its reverse.
    #[derive(Default)]
    struct Reverse {
        seen: RefCell<Vec<(Vec<u8>, Option<SocketAddrV4>)>>,
    }

    impl PacketHandler for Reverse {
        fn handle_packet(&self, data: &[u8], session: &mut Session<'_>) -> isize {
            self.seen.borrow_mut().push((data.to_vec(), session.peer_addr()));
            if session.state() == SocketState::Listening {
                let reply: Vec<u8> = data.iter().rev().copied().collect();
                session.send_packet(&reply).unwrap();
            }
            data.len() as isize
        }
    }

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig::new().max_fds(1024).wait_timeout(Duration::from_millis(10))).unwrap()
    }

    #[test]
    fn test_listener_replies_to_source() {
        let mut r = reactor();
        let server = Rc::new(Reverse::default());
        let client = Rc::new(Reverse::default());
        let sid = UdpSocket::listen_on(&mut r, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), server.clone()).unwrap();
        let port = r.get(sid).unwrap().local_addr.unwrap().port();
        let cid = UdpSocket::connect(&mut r, Ipv4Addr::LOCALHOST, port, client.clone()).unwrap();
        let client_port = r.get(cid).unwrap().local_addr.unwrap().port();

        r.send_packet(cid, b"abc").unwrap();
        for _ in 0..100 {
            if !client.seen.borrow().is_empty() {
                break;
            }
            r.dispatch().unwrap();
        }

        let seen = server.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"abc");
        assert_eq!(seen[0].1.unwrap().port(), client_port);
        assert_eq!(client.seen.borrow()[0].0, b"cba");
    }

    #[test]
    fn test_listener_without_peer_cannot_send() {
        let mut r = reactor();
        let sid = UdpSocket::listen_on(
            &mut r,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            Rc::new(Reverse::default()),
        )
        .unwrap();
        assert_eq!(r.send_packet(sid, b"x"), Err(NetError::NoPeer));
    }
}
