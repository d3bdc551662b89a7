//! Environment variable utilities
//!
//! Generic `env_get<T>` plus a few typed helpers used to seed tunables.
//!
//! # Usage
//!
//! ```ignore
//! use gvfiber_core::env::{env_get, env_get_bool, env_get_size};
//!
//! let threads: usize = env_get("GVF_THREADS", 4);
//! let use_caller = env_get_bool("GVF_USE_CALLER", false);
//! // Accepts "131072", "128k", "1m"
//! let stack = env_get_size("GVF_FIBER_STACK_SIZE", 128 * 1024);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and values that fail to parse both yield `default`.
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

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; an unset variable returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get a byte size, accepting an optional `k`/`m`/`g` suffix (powers of 1024)
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

/// Parse "4096", "128k", "128K", "2m", "1g"
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last()? {
        (i, 'k' | 'K') => (&s[..i], 10),
        (i, 'm' | 'M') => (&s[..i], 20),
        (i, 'g' | 'G') => (&s[..i], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__GVF_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__GVF_TEST_UNSET__", true));
        assert_eq!(env_get_str("__GVF_TEST_UNSET__", "hello"), "hello");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__GVF_TEST_NUM__", " 123 ");
        let val: usize = env_get("__GVF_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__GVF_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__GVF_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__GVF_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__GVF_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__GVF_TEST_BOOL__", v);
            assert!(env_get_bool("__GVF_TEST_BOOL__", false), "{v}");
        }
        for v in ["0", "false", "garbage"] {
            std::env::set_var("__GVF_TEST_BOOL__", v);
            assert!(!env_get_bool("__GVF_TEST_BOOL__", true), "{v}");
        }
        std::env::remove_var("__GVF_TEST_BOOL__");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("128k"), Some(128 * 1024));
        assert_eq!(parse_size("128K"), Some(128 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("12x"), None);
    }

    #[test]
    fn test_env_get_size() {
        std::env::set_var("__GVF_TEST_SIZE__", "64k");
        assert_eq!(env_get_size("__GVF_TEST_SIZE__", 1), 64 * 1024);
        std::env::set_var("__GVF_TEST_SIZE__", "junk");
        assert_eq!(env_get_size("__GVF_TEST_SIZE__", 1), 1);
        std::env::remove_var("__GVF_TEST_SIZE__");
    }
}
