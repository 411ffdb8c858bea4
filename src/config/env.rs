//! Environment variable loading helpers. Grounded on the teacher's
//! `tooling::config::env` (`get_env`/`get_env_parse_or`), reused here
//! under `CoreError` instead of a dedicated tooling error type.

use std::env as std_env;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// `Some(value)` if set, `None` if unset. Fails only if the value isn't
/// valid UTF-8.
pub fn get_env(key: &str) -> Result<Option<String>> {
    match std_env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(std_env::VarError::NotPresent) => Ok(None),
        Err(std_env::VarError::NotUnicode(_)) => {
            Err(CoreError::Validation(format!("environment variable {key} is not valid UTF-8")))
        }
    }
}

/// `value` if set, else `default`.
pub fn get_env_or(key: &str, default: impl Into<String>) -> Result<String> {
    Ok(get_env(key)?.unwrap_or_else(|| default.into()))
}

/// Parsed value if set and parseable, else `default`. An unparseable set
/// value is a configuration error, not a silent fallback.
pub fn get_env_parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| CoreError::Validation(format!("invalid value for {key}: {e}"))),
        None => Ok(default),
    }
}
