//! Reactor configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults.rs`)
//!
//! # Example
//!
//! ```rust,ignore
//! use evnet_reactor::ReactorConfig;
//!
//! let config = ReactorConfig::from_env()
//!     .max_fds(4096)
//!     .wait_timeout(Duration::from_millis(5));
//! ```

pub mod defaults;

use std::time::Duration;

use evnet_core::env::{env_get, env_get_bool, env_get_millis, env_get_secs};

/// Reactor and socket tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactorConfig {
    /// Registry size; also the descriptor limit requested from the kernel
    pub max_fds: usize,
    /// Longest a single `dispatch()` blocks in the poller
    pub wait_timeout: Duration,
    /// Registry slots checked for idle timeout per dispatch
    pub timeout_sweep_batch: usize,
    /// Idle timeout for accepted TCP sockets (zero disables)
    pub accept_timeout: Duration,
    /// Handshake deadline for outbound TCP sockets
    pub connect_timeout: Duration,
    /// Bytes read per receive call
    pub max_read_size: usize,
    /// UDP kernel buffer size
    pub udp_buffer_size: usize,
    /// Set `TCP_NODELAY` on accepted sockets
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive on accepted sockets
    pub keepalive: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            max_fds: defaults::MAX_FDS,
            wait_timeout: Duration::from_millis(defaults::WAIT_TIMEOUT_MS),
            timeout_sweep_batch: defaults::TIMEOUT_SWEEP_BATCH,
            accept_timeout: Duration::from_secs(defaults::ACCEPT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
            max_read_size: defaults::MAX_READ_SIZE,
            udp_buffer_size: defaults::UDP_BUFFER_SIZE,
            tcp_nodelay: defaults::TCP_NODELAY,
            keepalive: defaults::KEEPALIVE,
        }
    }

    /// Defaults overlaid with environment variables (all optional):
    /// - `EVNET_MAX_FDS`
    /// - `EVNET_WAIT_TIMEOUT_MS`
    /// - `EVNET_TIMEOUT_SWEEP_BATCH`
    /// - `EVNET_ACCEPT_TIMEOUT_SECS`
    /// - `EVNET_CONNECT_TIMEOUT_SECS`
    /// - `EVNET_MAX_READ_SIZE`
    /// - `EVNET_UDP_BUFFER_SIZE`
    /// - `EVNET_TCP_NODELAY` (0/1)
    /// - `EVNET_KEEPALIVE` (0/1)
    pub fn from_env() -> Self {
        let d = Self::new();
        Self {
            max_fds: env_get("EVNET_MAX_FDS", d.max_fds),
            wait_timeout: env_get_millis("EVNET_WAIT_TIMEOUT_MS", d.wait_timeout),
            timeout_sweep_batch: env_get("EVNET_TIMEOUT_SWEEP_BATCH", d.timeout_sweep_batch),
            accept_timeout: env_get_secs("EVNET_ACCEPT_TIMEOUT_SECS", d.accept_timeout),
            connect_timeout: env_get_secs("EVNET_CONNECT_TIMEOUT_SECS", d.connect_timeout),
            max_read_size: env_get("EVNET_MAX_READ_SIZE", d.max_read_size),
            udp_buffer_size: env_get("EVNET_UDP_BUFFER_SIZE", d.udp_buffer_size),
            tcp_nodelay: env_get_bool("EVNET_TCP_NODELAY", d.tcp_nodelay),
            keepalive: env_get_bool("EVNET_KEEPALIVE", d.keepalive),
        }
    }

    // Builder methods

    pub fn max_fds(mut self, n: usize) -> Self {
        self.max_fds = n;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn timeout_sweep_batch(mut self, n: usize) -> Self {
        self.timeout_sweep_batch = n;
        self
    }

    pub fn accept_timeout(mut self, d: Duration) -> Self {
        self.accept_timeout = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn max_read_size(mut self, n: usize) -> Self {
        self.max_read_size = n;
        self
    }

    pub fn udp_buffer_size(mut self, n: usize) -> Self {
        self.udp_buffer_size = n;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn keepalive(mut self, enable: bool) -> Self {
        self.keepalive = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fds == 0 {
            return Err(ConfigError::InvalidValue("max_fds must be > 0"));
        }
        if self.max_fds > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_fds must fit a file descriptor"));
        }
        if self.timeout_sweep_batch == 0 {
            return Err(ConfigError::InvalidValue("timeout_sweep_batch must be > 0"));
        }
        if self.max_read_size == 0 {
            return Err(ConfigError::InvalidValue("max_read_size must be > 0"));
        }
        if self.udp_buffer_size > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("udp_buffer_size must fit a c_int"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
