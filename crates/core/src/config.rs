//! Environment-driven configuration helpers.
//!
//! Settings are read through a lookup function rather than `std::env`
//! directly so that parsing can be tested without touching process state.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Key/value lookup used to resolve configuration (usually `std::env::var`).
pub trait EnvLookup {
    fn get(&self, key: &str) -> Option<String>;

    /// Parse `key` if present; absent or blank values yield `None`.
    fn parse<T>(&self, key: &str) -> CoreResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| CoreError::invalid_config(key, e.to_string())),
            _ => Ok(None),
        }
    }

    /// Parse a millisecond count into a `Duration`.
    fn parse_millis(&self, key: &str) -> CoreResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

impl<F> EnvLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// Lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
