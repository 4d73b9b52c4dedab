//! # Socket endpoints
//!
//! Every registered descriptor is an [`Endpoint`]: a small state machine
//! the reactor drives through `handle_read` / `handle_write` /
//! `handle_error` / `handle_timeout`. Two implementations ship here:
//!
//! - [`TcpSocket`] - listener, outbound connection or accepted connection
//! - [`UdpSocket`] - bound listener or connected peer
//!
//! ```text
//!            connect() EINPROGRESS          WRITE-ready, SO_ERROR == 0
//!   (new) ──────────────────────► Connecting ───────────────────► Connected ─┐
//!     │                                │                                     │
//!     │ listen()           accept()    │ ERROR / timeout                     │ ERROR / EOF /
//!     └──► Listening ───────────► Accepted                                   │ bad frame /
//!              │                    │  │                                     │ idle timeout
//!              └────────────────────┴──┴──────────► Closing ◄────────────────┘
//! ```
//!
//! Bytes read from the kernel accumulate in the endpoint's input buffer and
//! are offered to a shared [`PacketHandler`], which reports how many bytes
//! made up one complete packet.

mod tcp;
mod udp;

pub use tcp::TcpSocket;
pub use udp::UdpSocket;

use std::fmt;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use evnet_core::{ElasticBuffer, Interest};

use crate::error::Result;
use crate::reactor::Reactor;

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// Outbound TCP handshake in flight.
    Connecting,
    /// TCP handshake done, or UDP socket with a fixed peer.
    Connected,
    /// Accepting connections (TCP) or datagrams from anyone (UDP).
    Listening,
    /// Inbound TCP connection. Behaves like `Connected`.
    Accepted,
    /// Deregistered, waiting for the deferred sweep to drop it.
    Closing,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Accepted => "accepted",
            Self::Closing => "closing",
        }
    }

    /// True for states that carry application data.
    #[inline]
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connected | Self::Accepted)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Tcp,
    Udp,
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Handle to a registered endpoint.
///
/// The generation is bumped on every registration of a slot, so a handle
/// kept after its socket closed never resolves to a later socket that
/// happens to get the same fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    pub fd: RawFd,
    pub generation: u32,
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.fd, self.generation)
    }
}

/// State every endpoint carries.
#[derive(Debug, Clone)]
pub struct SocketMeta {
    pub fd: RawFd,
    /// Set by the reactor on registration.
    pub generation: u32,
    pub state: SocketState,
    pub socket_type: SocketType,
    pub created_at: Instant,
    pub last_access: Instant,
    /// Idle limit; zero means never time out.
    pub timeout: Duration,
    pub peer_addr: Option<SocketAddrV4>,
    pub local_addr: Option<SocketAddrV4>,
    /// Interest currently registered with the poller.
    pub interest: Interest,
}

impl SocketMeta {
    pub fn new(fd: RawFd, socket_type: SocketType, state: SocketState) -> Self {
        let now = Instant::now();
        Self {
            fd,
            generation: 0,
            state,
            socket_type,
            created_at: now,
            last_access: now,
            timeout: Duration::ZERO,
            peer_addr: None,
            local_addr: None,
            interest: Interest::NONE,
        }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        SocketId {
            fd: self.fd,
            generation: self.generation,
        }
    }

    #[inline]
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// True once `timeout` is set and the socket has been idle longer.
    pub fn is_idle(&self, now: Instant) -> bool {
        !self.timeout.is_zero() && now.saturating_duration_since(self.last_access) > self.timeout
    }
}

/// Something the reactor can register and drive.
///
/// Callbacks receive the reactor so they can re-arm interest, deregister
/// themselves or reach other sockets. While a callback runs the endpoint is
/// checked out of its registry slot.
pub trait Endpoint {
    fn meta(&self) -> &SocketMeta;
    fn meta_mut(&mut self) -> &mut SocketMeta;

    fn handle_read(&mut self, reactor: &mut Reactor);
    fn handle_write(&mut self, reactor: &mut Reactor);
    fn handle_error(&mut self, reactor: &mut Reactor);
    fn handle_timeout(&mut self, reactor: &mut Reactor, now: Instant);

    /// Queue or transmit one packet.
    fn send_packet(&mut self, reactor: &mut Reactor, data: &[u8]) -> Result<()>;

    /// Move to `Closing`, deregister and notify the handler. Idempotent.
    fn close(&mut self, reactor: &mut Reactor);
}

/// Application protocol callbacks, shared between a listener and every
/// socket it accepts.
pub trait PacketHandler {
    /// Inspect the buffered bytes of one socket.
    ///
    /// Return the length of one complete packet at the front of `data` to
    /// consume it (the handler is called again if bytes remain), `0` to wait
    /// for more bytes, or a negative value to close the socket. A value
    /// larger than `data.len()` also closes the socket.
    fn handle_packet(&self, data: &[u8], session: &mut Session<'_>) -> isize;

    /// Called exactly once when a socket moves to `Closing`.
    fn handle_close(&self, _meta: &SocketMeta) {}
}

/// What a `PacketHandler` sees of the socket it is serving.
pub struct Session<'a> {
    endpoint: &'a mut dyn Endpoint,
    reactor: &'a mut Reactor,
}

impl<'a> Session<'a> {
    pub fn new(endpoint: &'a mut dyn Endpoint, reactor: &'a mut Reactor) -> Self {
        Self { endpoint, reactor }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.endpoint.meta().id()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.endpoint.meta().fd
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.endpoint.meta().state
    }

    #[inline]
    pub fn socket_type(&self) -> SocketType {
        self.endpoint.meta().socket_type
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.endpoint.meta().peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.endpoint.meta().local_addr
    }

    pub fn meta(&self) -> &SocketMeta {
        self.endpoint.meta()
    }

    /// Reply on this socket.
    pub fn send_packet(&mut self, data: &[u8]) -> Result<()> {
        self.endpoint.send_packet(self.reactor, data)
    }

    /// Close this socket after the handler returns.
    pub fn close(&mut self) {
        self.endpoint.close(self.reactor)
    }

    /// Change the idle timeout of this socket. Zero disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.endpoint.meta_mut().timeout = timeout;
    }

    /// The reactor, for touching other sockets. This socket itself is
    /// checked out and answers `Busy` there; use the session methods.
    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }
}

/// Offer `input` to `handler` until it stops consuming.
///
/// The buffer is lent out of the endpoint for the duration so the handler
/// can hold the session (and thus the endpoint) mutably. Returns `false` if
/// the handler rejected the data, in which case the caller closes.
pub(crate) fn deliver<E: Endpoint + 'static>(
    endpoint: &mut E,
    input: &mut ElasticBuffer,
    handler: &dyn PacketHandler,
    reactor: &mut Reactor,
) -> bool {
    while !input.is_empty() && endpoint.meta().state != SocketState::Closing {
        let n = {
            let mut session = Session::new(endpoint, reactor);
            handler.handle_packet(input.data(), &mut session)
        };
        if n == 0 {
            break;
        }
        if n < 0 || n as usize > input.size() {
            tracing::warn!(
                fd = endpoint.meta().fd,
                verdict = n,
                buffered = input.size(),
                "packet handler rejected input"
            );
            return false;
        }
        input.erase(n as usize);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_detection() {
        let mut meta = SocketMeta::new(3, SocketType::Tcp, SocketState::Accepted);
        let now = Instant::now();
        assert!(!meta.is_idle(now + Duration::from_secs(3600)));

        meta.timeout = Duration::from_secs(5);
        meta.last_access = now;
        assert!(!meta.is_idle(now + Duration::from_secs(5)));
        assert!(meta.is_idle(now + Duration::from_secs(6)));
        // A clock reading behind last_access is not idle.
        assert!(!meta.is_idle(now));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SocketState::Accepted.to_string(), "accepted");
        assert!(SocketState::Accepted.is_established());
        assert!(!SocketState::Listening.is_established());
        assert_eq!(SocketType::Udp.to_string(), "udp");
        assert_eq!(SocketId { fd: 7, generation: 2 }.to_string(), "7#2");
    }
}
