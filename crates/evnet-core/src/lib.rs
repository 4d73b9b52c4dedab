//! # evnet-core
//!
//! Core types shared by the evnet reactor and wire codec.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that talks to the kernel lives in `evnet-reactor`.
//!
//! ## Modules
//!
//! - `buffer` - Block-granular elastic byte buffer for socket staging
//! - `interest` - READ / WRITE / ERROR interest mask
//! - `queue` - Bounded cross-thread handoff queue
//! - `env` - Environment variable utilities

pub mod buffer;
pub mod interest;
pub mod queue;
pub mod env;

// Re-exports for convenience
pub use buffer::{BufferError, ElasticBuffer};
pub use interest::Interest;
pub use queue::BoundedQueue;
pub use env::{env_get, env_get_bool, env_get_opt};
