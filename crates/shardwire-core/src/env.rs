//! Environment variable utilities
//!
//! Every tunable in shardwire can be overridden through a `SHARDWIRE_*`
//! variable. Unset or unparsable values fall back to the supplied default.
//!
//! ```ignore
//! use shardwire_core::env::{env_get, env_get_ms};
//!
//! let passes: usize = env_get("SHARDWIRE_MAX_DRAIN_PASSES", 8);
//! let heartbeat = env_get_ms("SHARDWIRE_HEARTBEAT_MS", Duration::from_secs(1));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true and
/// "0", "false", "no", "off" as false. Anything else keeps the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a duration expressed in whole milliseconds.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
