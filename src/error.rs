use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration failures. All of these abort the run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permissions matrix is malformed: {0}")]
    Matrix(String),
}

/// Failures from external-service capability calls.
///
/// Reconcilers translate these into FAILURE records; nothing here is allowed
/// to escape a reconciler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} response could not be decoded: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    #[error("{service} authentication failed: {message}")]
    Auth {
        service: &'static str,
        message: String,
    },

    #[error("{service} command-line helper failed: {message}")]
    Subprocess {
        service: &'static str,
        message: String,
    },
}

impl ApiError {
    /// Transient faults are retried with backoff by the HTTP implementors;
    /// business-logic failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// A 401 from the password store triggers one token refresh and retry.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. }) || matches!(self, Self::Auth { .. })
    }
}
