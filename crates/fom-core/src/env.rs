//! Environment variable helpers used by the configuration layer
//!
//! ```ignore
//! use fom_core::env::{env_get, env_get_bool};
//!
//! let localities: usize = env_get("FOM_NR_LOCALITIES", 4);
//! let bind: bool = env_get_bool("FOM_BIND_CORES", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read `key` as a boolean flag
///
/// "1", "true", "yes" and "on" (any case) are true, "0", "false", "no" and
/// "off" are false; anything else yields `default`.
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
