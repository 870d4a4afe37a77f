//! Error types for fetch-kit.

use std::fmt;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by queries, the cache store and optimistic updates.
///
/// Cancellation is deliberately absent: a superseded fetch resolves to
/// `Ok(None)` instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The fetch function failed.
    FetchError(String),

    /// The fetch function reported a transport timeout.
    Timeout(String),

    /// Invalid configuration value.
    ConfigError(String),

    /// Invalid input, such as an empty cache key.
    ValidationError(String),

    /// A cache entry exists for `key` but holds a different type.
    TypeMismatch { key: String, expected: &'static str },

    /// The query was unmounted before the operation could run.
    Unmounted,
}

impl Error {
    /// Shorthand for wrapping any displayable failure as a fetch error.
    pub fn fetch(err: impl fmt::Display) -> Self {
        Error::FetchError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FetchError(msg) => write!(f, "Fetch failed: {}", msg),
            Error::Timeout(msg) => write!(f, "Fetch timed out: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::TypeMismatch { key, expected } => write!(
                f,
                "Cache entry for key {} does not hold a value of type {}",
                key, expected
            ),
            Error::Unmounted => write!(f, "Query is unmounted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigError(e.to_string())
    }
}
