//! Cache key construction and validation.
//!
//! Keys are plain strings. Scoped keys use the `"{namespace}:{id}"` format,
//! which lets a host clear everything belonging to one tenant at once.

use crate::error::{Error, Result};

/// Separator between namespace and id.
pub const SEPARATOR: char = ':';

/// Helper for building and splitting namespaced cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build a namespaced key.
    ///
    /// ```
    /// use fetch_kit::key::CacheKeyBuilder;
    ///
    /// assert_eq!(
    ///     CacheKeyBuilder::build("tenant-42", "dashboard-stats"),
    ///     "tenant-42:dashboard-stats"
    /// );
    /// ```
    pub fn build(namespace: &str, id: &str) -> String {
        format!("{}{}{}", namespace, SEPARATOR, id)
    }

    /// Split a key into namespace and id.
    ///
    /// Only the first separator counts, so ids may contain `:`.
    /// Returns `None` for keys without a namespace.
    pub fn parse(key: &str) -> Option<(&str, &str)> {
        key.split_once(SEPARATOR)
    }

    /// Namespace prefix (including the separator) used for prefix matching.
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}{}", namespace, SEPARATOR)
    }

    /// Reject keys that cannot identify a resource.
    pub fn validate(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::ValidationError("Cache key must not be empty".to_string()));
        }
        Ok(())
    }
}
