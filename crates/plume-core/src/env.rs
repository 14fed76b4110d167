//! Environment overrides
//!
//! Every `[main]` config value can be overridden from the environment
//! with a `PLUME_` prefixed variable. Values that fail to parse are
//! ignored and the configured value stays in place.
//!
//! ```ignore
//! use plume_core::env::{env_get, env_override};
//!
//! let threads: usize = env_get("PLUME_THREADS", 1);
//! env_override("PLUME_MAXFD", &mut cfg.maxfd);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean switch in the config file's spelling: "on"/"off" as well as
/// "1", "true", "yes".
pub fn parse_switch(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get environment variable as a switch, or return default
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_switch(&v))
        .unwrap_or(default)
}

/// Overwrite `target` when `key` is set and parses.
///
/// Returns true when an override was applied.
pub fn env_override<T>(key: &str, target: &mut T) -> bool
where
    T: FromStr,
{
    match env_get_opt(key) {
        Some(v) => {
            *target = v;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__PLUME_UNSET_VAR__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u16>("__PLUME_UNSET_VAR__").is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__PLUME_TEST_NUM__", " 123 ");
        let val: usize = env_get("__PLUME_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__PLUME_TEST_NUM__");
    }

    #[test]
    fn test_parse_switch() {
        for on in ["on", "ON", "1", "true", "yes"] {
            assert_eq!(parse_switch(on), Some(true), "{on}");
        }
        for off in ["off", "0", "false", "No"] {
            assert_eq!(parse_switch(off), Some(false), "{off}");
        }
        assert_eq!(parse_switch("maybe"), None);
    }

    #[test]
    fn test_env_get_bool_garbage_keeps_default() {
        std::env::set_var("__PLUME_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__PLUME_TEST_BOOL__", true));
        std::env::set_var("__PLUME_TEST_BOOL__", "off");
        assert!(!env_get_bool("__PLUME_TEST_BOOL__", true));
        std::env::remove_var("__PLUME_TEST_BOOL__");
    }

    #[test]
    fn test_env_override() {
        let mut maxfd = 1024usize;
        std::env::set_var("__PLUME_TEST_MAXFD__", "4096");
        assert!(env_override("__PLUME_TEST_MAXFD__", &mut maxfd));
        assert_eq!(maxfd, 4096);

        std::env::set_var("__PLUME_TEST_MAXFD__", "lots");
        assert!(!env_override("__PLUME_TEST_MAXFD__", &mut maxfd));
        assert_eq!(maxfd, 4096);
        std::env::remove_var("__PLUME_TEST_MAXFD__");
    }
}
