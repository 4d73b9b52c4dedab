//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `ReactorConfig::from_env()`.
//!
//! ```ignore
//! use evnet_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let max_fds: usize = env_get("EVNET_MAX_FDS", 65536);
//! let nodelay = env_get_bool("EVNET_TCP_NODELAY", true);
//! let wait = env_get_millis("EVNET_WAIT_TIMEOUT_MS", Duration::from_millis(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" are true and "0", "false", "no",
/// "off" are false (case-insensitive). Anything else yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Duration given in milliseconds.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map(Duration::from_millis).unwrap_or(default)
}

/// Duration given in whole seconds.
#[inline]
pub fn env_get_secs(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map(Duration::from_secs).unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__EVNET_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u16>("__EVNET_TEST_UNSET__").is_none());
        assert!(env_get_bool("__EVNET_TEST_UNSET__", true));
        assert_eq!(
            env_get_millis("__EVNET_TEST_UNSET__", Duration::from_millis(7)),
            Duration::from_millis(7)
        );
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__EVNET_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__EVNET_TEST_NUM__", 0), 123);
        assert_eq!(env_get_secs("__EVNET_TEST_NUM__", Duration::ZERO), Duration::from_secs(123));

        std::env::set_var("__EVNET_TEST_NUM__", "not_a_number");
        assert_eq!(env_get::<usize>("__EVNET_TEST_NUM__", 99), 99);
        std::env::remove_var("__EVNET_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("off", false), ("No", false)] {
            std::env::set_var("__EVNET_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__EVNET_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::set_var("__EVNET_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__EVNET_TEST_BOOL__", true));
        std::env::remove_var("__EVNET_TEST_BOOL__");
    }
}
