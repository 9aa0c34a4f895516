//! Environment variable parsing
//!
//! Runtime knobs are plain `STRAND_*` variables. All lookups funnel
//! through here so fallback behavior is uniform: a missing or
//! malformed value keeps the built-in default, never errors.

use std::str::FromStr;

/// Read `key` as a `T`, keeping `default` when the variable is unset
/// or does not parse
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read `key` as a boolean flag
///
/// Accepts 1/true/yes/on and 0/false/no/off, case-insensitive; any
/// other value keeps the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => parse_flag(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_keeps_default() {
        let val: usize = env_get("__STRAND_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__STRAND_TEST_UNSET__", true));
    }

    #[test]
    fn test_parse_with_whitespace() {
        std::env::set_var("__STRAND_TEST_NUM__", " 123 ");
        let val: usize = env_get("__STRAND_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__STRAND_TEST_NUM__");
    }

    #[test]
    fn test_flag_spellings() {
        for (raw, want) in [
            ("1", Some(true)),
            ("On", Some(true)),
            ("YES", Some(true)),
            ("0", Some(false)),
            ("off", Some(false)),
            ("No", Some(false)),
            ("maybe", None),
        ] {
            assert_eq!(parse_flag(raw), want, "parsing {:?}", raw);
        }
    }

    #[test]
    fn test_malformed_keeps_default() {
        std::env::set_var("__STRAND_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__STRAND_TEST_BAD__", 99);
        assert_eq!(val, 99);
        // Unrecognized flag text keeps the default too, in both
        // directions
        assert!(env_get_bool("__STRAND_TEST_BAD__", true));
        assert!(!env_get_bool("__STRAND_TEST_BAD__", false));
        std::env::remove_var("__STRAND_TEST_BAD__");
    }
}
