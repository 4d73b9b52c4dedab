//! Reactor and socket error types.

use std::fmt;

use evnet_core::BufferError;
use nix::errno::Errno;

use crate::config::ConfigError;
use crate::socket::SocketState;

#[derive(Debug, Clone, PartialEq)]
pub enum NetError {
    /// The descriptor already has an endpoint in the registry.
    AlreadyRegistered { fd: i32 },
    /// The descriptor does not fit the fd-indexed registry.
    FdOutOfRange { fd: i32, max: usize },
    /// Every registry slot is taken.
    RegistryFull { capacity: usize },
    /// No endpoint behind this handle (never added, removed, or stale).
    NotRegistered { fd: i32 },
    /// The endpoint is running a callback and cannot be borrowed again.
    Busy { fd: i32 },
    /// A socket or poller syscall failed.
    Os(Errno),
    /// `RLIMIT_NOFILE` could not be read or raised.
    Rlimit(Errno),
    /// The epoll/kqueue instance could not be created.
    PollerSetup(Errno),
    /// The operation is not valid in the socket's current state.
    InvalidState(SocketState),
    /// A datagram went out truncated.
    ShortSend { sent: usize, len: usize },
    /// A UDP socket has no peer to send to yet.
    NoPeer,
    /// Staging buffer growth failed.
    Buffer(BufferError),
    /// Rejected configuration.
    Config(ConfigError),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered { fd } => write!(f, "fd {} already registered", fd),
            Self::FdOutOfRange { fd, max } => write!(f, "fd {} outside registry of {}", fd, max),
            Self::RegistryFull { capacity } => write!(f, "registry full ({} sockets)", capacity),
            Self::NotRegistered { fd } => write!(f, "fd {} not registered", fd),
            Self::Busy { fd } => write!(f, "fd {} is busy in a callback", fd),
            Self::Os(e) => write!(f, "OS error: {}", e),
            Self::Rlimit(e) => write!(f, "RLIMIT_NOFILE: {}", e),
            Self::PollerSetup(e) => write!(f, "poller setup: {}", e),
            Self::InvalidState(s) => write!(f, "invalid socket state: {}", s),
            Self::ShortSend { sent, len } => write!(f, "short send: {} of {} bytes", sent, len),
            Self::NoPeer => write!(f, "no peer address"),
            Self::Buffer(e) => write!(f, "buffer: {}", e),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) | Self::Rlimit(e) | Self::PollerSetup(e) => Some(e),
            Self::Buffer(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Errno> for NetError {
    fn from(e: Errno) -> Self {
        Self::Os(e)
    }
}

impl From<BufferError> for NetError {
    fn from(e: BufferError) -> Self {
        Self::Buffer(e)
    }
}

impl From<ConfigError> for NetError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
