//! # evnet-reactor
//!
//! Single-threaded readiness reactor with TCP and UDP endpoints.
//!
//! ```text
//!   ┌──────────────────────── Reactor ─────────────────────────┐
//!   │  slots[fd] ──► Box<dyn Endpoint>   (TcpSocket/UdpSocket) │
//!   │  Box<dyn Poller>  (epoll | kqueue)                       │
//!   │  deferred close set, timeout sweep cursor                │
//!   └──────────────┬───────────────────────────────────────────┘
//!                  │ handle_read / handle_write / ...
//!                  ▼
//!           input ElasticBuffer ──► Rc<dyn PacketHandler>
//! ```
//!
//! ## Modules
//!
//! - `reactor` - Registry, deferred destruction and the dispatch loop
//! - `poller` - `Poller` trait with epoll and kqueue backends
//! - `socket` - `Endpoint` / `PacketHandler` traits, TCP and UDP sockets
//! - `config` - `ReactorConfig` with environment overrides
//! - `error` - `NetError`
//!
//! Everything here is `!Send`: run one reactor per thread and hand work
//! across threads with `evnet_core::BoundedQueue`.

pub mod config;
pub mod error;
pub mod poller;
pub mod reactor;
pub mod socket;

mod sys;

pub use config::{ConfigError, ReactorConfig};
pub use error::{NetError, Result};
pub use evnet_core::Interest;
pub use poller::{new_poller, DefaultPoller, Poller, Readiness};
pub use reactor::Reactor;
pub use socket::{
    Endpoint, PacketHandler, Session, SocketId, SocketMeta, SocketState, SocketType, TcpSocket,
    UdpSocket,
};
