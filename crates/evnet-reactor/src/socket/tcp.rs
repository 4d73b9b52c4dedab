//! TCP endpoint: listener, outbound connection or accepted connection.
//!
//! Level-triggered. WRITE interest stays armed only while the output buffer
//! holds bytes the kernel did not take; the poller is reprogrammed only when
//! that armed state flips.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use evnet_core::{ElasticBuffer, Interest};
use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};

use super::{deliver, Endpoint, PacketHandler, SocketId, SocketMeta, SocketState, SocketType};
use crate::config::defaults;
use crate::error::{NetError, Result};
use crate::reactor::Reactor;
use crate::sys;

pub struct TcpSocket {
    meta: SocketMeta,
    input: ElasticBuffer,
    output: ElasticBuffer,
    handler: Rc<dyn PacketHandler>,
    /// WRITE is part of the registered interest.
    write_armed: bool,
    /// `handle_close` already ran.
    notified: bool,
}

impl TcpSocket {
    fn new(fd: RawFd, state: SocketState, handler: Rc<dyn PacketHandler>) -> Self {
        Self {
            meta: SocketMeta::new(fd, SocketType::Tcp, state),
            input: ElasticBuffer::new(),
            output: ElasticBuffer::new(),
            handler,
            write_armed: false,
            notified: false,
        }
    }

    /// Listen on `0.0.0.0:port`.
    pub fn listen(
        reactor: &mut Reactor,
        port: u16,
        backlog: i32,
        handler: Rc<dyn PacketHandler>,
    ) -> Result<SocketId> {
        Self::listen_on(reactor, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), backlog, handler)
    }

    /// Listen on `addr`. Port 0 picks an ephemeral port; read it back from
    /// `Reactor::get(id).local_addr`.
    pub fn listen_on(
        reactor: &mut Reactor,
        addr: SocketAddrV4,
        backlog: i32,
        handler: Rc<dyn PacketHandler>,
    ) -> Result<SocketId> {
        let span = reactor.span().clone();
        let _enter = span.enter();

        let fd = sys::new_socket(libc::SOCK_STREAM)?;
        // From here the socket owns the fd and closes it on any early return.
        let mut sock = Box::new(Self::new(fd, SocketState::Listening, handler));
        let bound = sys::setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .and_then(|_| sys::bind(fd, &addr))
            .and_then(|_| sys::check(unsafe { libc::listen(fd, backlog) }).map(|_| ()));
        if let Err(e) = bound {
            error!(%addr, error = %e, "tcp listen failed");
            return Err(NetError::Os(e));
        }
        sock.meta.local_addr = sys::local_addr(fd).ok();
        let local = sock.meta.local_addr.unwrap_or(addr);

        let id = reactor.add_socket(sock, Interest::READ_ERROR)?;
        info!(fd, addr = %local, backlog, "tcp listening");
        Ok(id)
    }

    /// Start a non-blocking connect to `ip:port`.
    ///
    /// The handshake completes on the first WRITE readiness; a failure or a
    /// handshake slower than `connect_timeout` closes the socket and reaches
    /// the handler as `handle_close`.
    pub fn connect(
        reactor: &mut Reactor,
        ip: Ipv4Addr,
        port: u16,
        handler: Rc<dyn PacketHandler>,
    ) -> Result<SocketId> {
        let span = reactor.span().clone();
        let _enter = span.enter();

        let peer = SocketAddrV4::new(ip, port);
        let fd = sys::new_socket(libc::SOCK_STREAM)?;
        let mut sock = Box::new(Self::new(fd, SocketState::Connecting, handler));
        sock.meta.peer_addr = Some(peer);
        if reactor.config().tcp_nodelay {
            sock.set_nodelay();
        }

        let sa = sys::to_sockaddr(&peer);
        let ret = unsafe {
            libc::connect(fd, &sa as *const libc::sockaddr_in as *const libc::sockaddr, sys::sockaddr_len())
        };
        let interest = if ret == 0 {
            sock.meta.state = SocketState::Connected;
            Interest::READ_ERROR
        } else {
            match sys::last_errno() {
                Errno::EINPROGRESS => {
                    sock.meta.timeout = reactor.config().connect_timeout;
                    sock.write_armed = true;
                    Interest::ALL
                }
                e => {
                    warn!(%peer, error = %e, "tcp connect failed");
                    return Err(NetError::Os(e));
                }
            }
        };
        sock.meta.local_addr = sys::local_addr(fd).ok();
        let state = sock.meta.state;

        let id = reactor.add_socket(sock, interest)?;
        debug!(fd, %peer, %state, "tcp connect started");
        Ok(id)
    }

    /// Bytes queued for the kernel.
    pub fn pending_output(&self) -> usize {
        self.output.size()
    }

    fn set_nodelay(&self) {
        if let Err(e) = sys::setsockopt_int(self.meta.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
            debug!(fd = self.meta.fd, error = %e, "TCP_NODELAY not set");
        }
    }

    // ========================================================================
    // Listener
    // ========================================================================

    fn accept_one(&mut self, reactor: &mut Reactor) {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = sys::sockaddr_len();
        let fd = unsafe {
            libc::accept(
                self.meta.fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            let e = sys::last_errno();
            if is_transient_accept(e) {
                trace!(fd = self.meta.fd, error = %e, "accept deferred");
            } else {
                error!(fd = self.meta.fd, error = %e, "accept failed, closing listener");
                self.close(reactor);
            }
            return;
        }

        let peer = sys::from_sockaddr(&sa);
        let mut conn = Box::new(Self::new(fd, SocketState::Accepted, Rc::clone(&self.handler)));
        if let Err(e) = sys::prepare_accepted(fd) {
            warn!(fd, %peer, error = %e, "dropping accepted socket");
            return;
        }

        let (nodelay, keepalive, accept_timeout) = {
            let cfg = reactor.config();
            (cfg.tcp_nodelay, cfg.keepalive, cfg.accept_timeout)
        };
        if nodelay {
            conn.set_nodelay();
        }
        if keepalive {
            let enabled = sys::enable_keepalive(
                fd,
                defaults::KEEPALIVE_IDLE_SECS,
                defaults::KEEPALIVE_INTERVAL_SECS,
                defaults::KEEPALIVE_COUNT,
            );
            if let Err(e) = enabled {
                debug!(fd, error = %e, "keepalive not enabled");
            }
        }
        conn.meta.timeout = accept_timeout;
        conn.meta.peer_addr = Some(peer);
        conn.meta.local_addr = sys::local_addr(fd).ok();

        match reactor.add_socket(conn, Interest::READ_ERROR) {
            Ok(id) => debug!(listener = self.meta.fd, socket = %id, %peer, "tcp accepted"),
            Err(e) => warn!(listener = self.meta.fd, %peer, error = %e, "accepted socket rejected"),
        }
    }

    // ========================================================================
    // Established
    // ========================================================================

    fn read_ready(&mut self, reactor: &mut Reactor) {
        let mut scratch = reactor.take_scratch();
        let received = recv_into(self.meta.fd, &mut self.input, &mut scratch);
        reactor.return_scratch(scratch);

        match received {
            Ok(0) => {
                debug!(fd = self.meta.fd, "peer closed");
                self.close(reactor);
                return;
            }
            Ok(n) => trace!(fd = self.meta.fd, bytes = n, buffered = self.input.size(), "recv"),
            Err(NetError::Os(e)) if sys::is_transient(e) => return,
            Err(e) => {
                warn!(fd = self.meta.fd, error = %e, "recv failed");
                self.close(reactor);
                return;
            }
        }
        self.meta.touch();

        let mut input = mem::take(&mut self.input);
        let handler = Rc::clone(&self.handler);
        let accepted = deliver(self, &mut input, handler.as_ref(), reactor);
        self.input = input;
        if !accepted {
            self.close(reactor);
        }
    }

    fn finish_connect(&mut self, reactor: &mut Reactor) {
        let pending = match sys::take_socket_error(self.meta.fd) {
            Ok(pending) => pending,
            Err(e) => Some(e),
        };
        if let Some(e) = pending {
            warn!(fd = self.meta.fd, peer = ?self.meta.peer_addr, error = %e, "tcp connect failed");
            self.close(reactor);
            return;
        }

        self.meta.state = SocketState::Connected;
        self.meta.timeout = Duration::ZERO;
        self.meta.touch();
        if self.meta.local_addr.map_or(true, |a| a.port() == 0) {
            self.meta.local_addr = sys::local_addr(self.meta.fd).ok();
        }
        info!(fd = self.meta.fd, peer = ?self.meta.peer_addr, "tcp connected");
        // Drops WRITE interest unless something is already queued.
        self.flush(reactor);
    }

    /// Push queued output to the kernel and re-arm WRITE to match what is
    /// left.
    fn flush(&mut self, reactor: &mut Reactor) {
        let mut sent = 0usize;
        while !self.output.is_empty() {
            match sys::send(self.meta.fd, self.output.data()) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.erase(n);
                    sent += n;
                }
                Err(e) if sys::is_transient(e) => break,
                Err(e) => {
                    warn!(fd = self.meta.fd, error = %e, "send failed");
                    self.close(reactor);
                    return;
                }
            }
        }
        if sent > 0 {
            self.meta.touch();
            trace!(fd = self.meta.fd, bytes = sent, pending = self.output.size(), "send");
        }
        self.set_write_armed(reactor, !self.output.is_empty());
    }

    fn set_write_armed(&mut self, reactor: &mut Reactor, armed: bool) {
        if armed == self.write_armed {
            return;
        }
        let interest = if armed { Interest::ALL } else { Interest::READ_ERROR };
        match reactor.mod_socket(self.meta.id(), interest) {
            Ok(()) => {
                self.write_armed = armed;
                self.meta.interest = interest;
            }
            Err(e) => {
                error!(fd = self.meta.fd, %interest, error = %e, "cannot re-arm socket");
                self.close(reactor);
            }
        }
    }

    fn notify_closed(&mut self) {
        if !self.notified {
            self.notified = true;
            self.meta.state = SocketState::Closing;
            self.handler.handle_close(&self.meta);
        }
    }
}

fn recv_into(fd: RawFd, input: &mut ElasticBuffer, scratch: &mut [u8]) -> Result<usize> {
    let n = sys::recv(fd, scratch)?;
    input.append(&scratch[..n])?;
    Ok(n)
}

/// Accept failures that leave the listener usable.
fn is_transient_accept(e: Errno) -> bool {
    sys::is_transient(e) || matches!(e, Errno::ECONNABORTED | Errno::EMFILE | Errno::ENFILE)
}

impl Endpoint for TcpSocket {
    fn meta(&self) -> &SocketMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SocketMeta {
        &mut self.meta
    }

    fn handle_read(&mut self, reactor: &mut Reactor) {
        match self.meta.state {
            SocketState::Listening => self.accept_one(reactor),
            SocketState::Connected | SocketState::Accepted => self.read_ready(reactor),
            // Readable before the handshake finished: the WRITE half of
            // the same event settles the connect.
            SocketState::Connecting | SocketState::Closing => {}
        }
    }

    fn handle_write(&mut self, reactor: &mut Reactor) {
        match self.meta.state {
            SocketState::Connecting => self.finish_connect(reactor),
            SocketState::Connected | SocketState::Accepted => self.flush(reactor),
            state => debug!(fd = self.meta.fd, %state, "unexpected write readiness"),
        }
    }

    fn handle_error(&mut self, reactor: &mut Reactor) {
        let cause = sys::take_socket_error(self.meta.fd).ok().flatten();
        match cause {
            Some(e) => warn!(fd = self.meta.fd, state = %self.meta.state, error = %e, "socket error"),
            None => warn!(fd = self.meta.fd, state = %self.meta.state, "socket error"),
        }
        self.close(reactor);
    }

    fn handle_timeout(&mut self, reactor: &mut Reactor, now: Instant) {
        let timed = matches!(
            self.meta.state,
            SocketState::Connecting | SocketState::Connected | SocketState::Accepted
        );
        if timed && self.meta.is_idle(now) {
            info!(
                fd = self.meta.fd,
                state = %self.meta.state,
                timeout_ms = self.meta.timeout.as_millis() as u64,
                "idle timeout"
            );
            self.close(reactor);
        }
    }

    fn send_packet(&mut self, reactor: &mut Reactor, data: &[u8]) -> Result<()> {
        if !self.meta.state.is_established() {
            return Err(NetError::InvalidState(self.meta.state));
        }
        if data.is_empty() {
            return Ok(());
        }
        // Queued bytes go out ahead of `data`.
        self.output.append(data)?;
        self.flush(reactor);
        Ok(())
    }

    fn close(&mut self, reactor: &mut Reactor) {
        if self.notified {
            return;
        }
        let id = self.meta.id();
        let was = self.meta.state;
        self.meta.state = SocketState::Closing;
        reactor.del_socket(id);
        debug!(fd = id.fd, from = %was, "tcp closing");
        self.notify_closed();
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        // Deregistered without `close()`: still tell the handler once.
        // Generation 0 never made it into the registry.
        if self.meta.generation != 0 {
            self.notify_closed();
        }
        sys::close_fd(self.meta.fd);
    }
}
