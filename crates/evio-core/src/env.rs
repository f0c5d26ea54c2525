//! Environment variable helpers used by the `from_env()` config builders
//!
//! Unset or unparsable variables fall back to the supplied default; a bad
//! value never aborts startup.
//!
//! ```ignore
//! use evio_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let max: usize = env_get("EVIO_POOL_MAX", 10);
//! let ignore = env_get_bool("EVIO_IGNORE_SIGPIPE", true);
//! let linger = env_get_millis("EVIO_POOL_LINGER_MS", Duration::from_secs(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and valid.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `"1" | "true" | "yes" | "on"` (any case) are true, everything else is
/// false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read a whole number of milliseconds as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
