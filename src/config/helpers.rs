//! Env-var parsing helpers shared by the config sections.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an optional env var. Empty values are treated as unset.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Read a required env var.
pub(crate) fn require_env(key: &str) -> Result<String, ConfigError> {
    optional_env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(key: &str, default: &str) -> String {
    optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Parse an env var into any `FromStr` type, with a default.
pub(crate) fn parse_optional_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match optional_env(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{}'", v),
        }),
        None => Ok(default),
    }
}

/// Parse an env var holding a number of seconds into a `Duration`.
pub(crate) fn parse_secs_env(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_optional_env(key, default_secs)?))
}

/// Parse an env var holding a number of milliseconds into a `Duration`.
pub(crate) fn parse_millis_env(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_optional_env(key, default_ms)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests use unique keys to avoid cross-test interference
    // (cargo runs tests in parallel within one process).

    #[test]
    fn empty_env_var_is_unset() {
        std::env::set_var("VAPD_TEST_EMPTY", "  ");
        assert!(optional_env("VAPD_TEST_EMPTY").is_none());
    }

    #[test]
    fn parse_with_default() {
        assert_eq!(
            parse_optional_env::<u16>("VAPD_TEST_UNSET_PORT", 41300).unwrap(),
            41300
        );
        std::env::set_var("VAPD_TEST_SET_PORT", "42001");
        assert_eq!(
            parse_optional_env::<u16>("VAPD_TEST_SET_PORT", 0).unwrap(),
            42001
        );
    }

    #[test]
    fn invalid_value_is_an_error() {
        std::env::set_var("VAPD_TEST_BAD_NUM", "not-a-number");
        let err = parse_optional_env::<u32>("VAPD_TEST_BAD_NUM", 1).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn secs_env_builds_duration() {
        std::env::set_var("VAPD_TEST_SECS", "90");
        assert_eq!(
            parse_secs_env("VAPD_TEST_SECS", 10).unwrap(),
            Duration::from_secs(90)
        );
    }
}
