use std::env;

use crate::error::ConfigError;

/// Read an optional environment variable, treating empty values as unset.
pub fn optional_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Read a required environment variable.
pub fn required_env(key: &str) -> Result<String, ConfigError> {
    optional_env(key).ok_or_else(|| ConfigError::Missing {
        key: key.to_string(),
    })
}

/// Parse an optional environment variable as usize, falling back to a default.
pub fn parse_usize_env(key: &str, default: usize) -> Result<usize, ConfigError> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a positive integer, got '{raw}'"),
        }),
    }
}
