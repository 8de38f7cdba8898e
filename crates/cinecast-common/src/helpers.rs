//! Common helper functions for Cinecast.

use crate::error::{Error, Result};

/// Reads a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; anything else is false.
/// Unset variables yield `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Reads an optional, non-blank string from the environment.
pub fn env_string(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::env(format!("failed to read {name}: {e}"))),
    }
}

/// Splits a `,`/`;` separated list, dropping blank entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_bool(value), "{value} should be truthy");
        }
    }

    #[test]
    fn test_parse_bool_falsy_values() {
        for value in ["0", "false", "", "nope", "enabled"] {
            assert!(!parse_bool(value), "{value} should be falsy");
        }
    }

    #[test]
    fn test_split_list_mixed_separators() {
        let entries = split_list("stun:a.example:3478, stun:b.example:3478;;  ");
        assert_eq!(entries, vec!["stun:a.example:3478", "stun:b.example:3478"]);
    }

    #[test]
    fn test_split_list_empty() {
        assert!(split_list("").is_empty());
        assert!(split_list(" , ; ").is_empty());
    }
}
