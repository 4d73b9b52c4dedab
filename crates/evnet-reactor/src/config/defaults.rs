//! Library defaults for `ReactorConfig`.

/// Registry size and the `RLIMIT_NOFILE` soft limit the reactor asks for.
pub const MAX_FDS: usize = 65536;

/// Upper bound on one poller wait.
pub const WAIT_TIMEOUT_MS: u64 = 10;

/// Registry slots visited by the idle-timeout sweep per dispatch.
pub const TIMEOUT_SWEEP_BATCH: usize = 1000;

/// Idle timeout given to accepted TCP sockets.
pub const ACCEPT_TIMEOUT_SECS: u64 = 60;

/// Deadline for an outbound TCP handshake.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Size of the shared receive scratch buffer. A UDP datagram larger than
/// this is truncated by the kernel.
pub const MAX_READ_SIZE: usize = 65536;

/// Kernel receive and send buffer requested for UDP sockets.
pub const UDP_BUFFER_SIZE: usize = 16 * 1024 * 1024;

pub const TCP_NODELAY: bool = true;

pub const KEEPALIVE: bool = false;

/// Keepalive probe timing, applied only when keepalive is on.
pub const KEEPALIVE_IDLE_SECS: u32 = 60;
pub const KEEPALIVE_INTERVAL_SECS: u32 = 10;
pub const KEEPALIVE_COUNT: u32 = 3;
