//! Query and store configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum age at which cached data is still served.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default age after which cached data is served but revalidated.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

/// Default number of retries after the initial failed attempt.
pub const DEFAULT_RETRY: u32 = 3;

/// Default backoff unit; attempt `n` waits `n` units.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Default bound on the number of keys held by a store.
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// Per-query fetch options.
///
/// Serialized form uses milliseconds:
///
/// ```
/// use fetch_kit::FetchOptions;
/// use std::time::Duration;
///
/// let options: FetchOptions =
///     serde_json::from_str(r#"{"stale_time_ms": 10000, "retry": 1}"#).unwrap();
/// assert_eq!(options.stale_time, Duration::from_secs(10));
/// assert_eq!(options.retry, 1);
/// assert_eq!(options.cache_time, Duration::from_secs(300));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Cached data at or beyond this age is treated as a miss.
    #[serde(rename = "cache_time_ms", with = "millis")]
    pub cache_time: Duration,

    /// Cached data at or beyond this age is served and refreshed in the background.
    #[serde(rename = "stale_time_ms", with = "millis")]
    pub stale_time: Duration,

    /// Maximum consecutive retries after the initial failure.
    pub retry: u32,

    /// Linear backoff unit.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            cache_time: DEFAULT_CACHE_TIME,
            stale_time: DEFAULT_STALE_TIME,
            retry: DEFAULT_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// The schedule is linear: `retry_delay * attempt`.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }

    /// Check option consistency.
    ///
    /// A `stale_time` above `cache_time` means data expires before it is ever
    /// considered stale. That is allowed, only logged.
    pub fn validate(&self) {
        if self.stale_time > self.cache_time {
            warn!(
                "⚠ stale_time ({:?}) exceeds cache_time ({:?}); cached data will expire before revalidation",
                self.stale_time, self.cache_time
            );
        }
    }

    /// Load options from the environment, falling back to defaults.
    ///
    /// Recognised variables (all integers):
    /// - `FETCH_KIT_CACHE_TIME_MS`
    /// - `FETCH_KIT_STALE_TIME_MS`
    /// - `FETCH_KIT_RETRY`
    /// - `FETCH_KIT_RETRY_DELAY_MS`
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but not a valid integer.
    pub fn from_env() -> Result<Self> {
        let mut options = FetchOptions::default();

        if let Some(ms) = env_u64("FETCH_KIT_CACHE_TIME_MS")? {
            options.cache_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("FETCH_KIT_STALE_TIME_MS")? {
            options.stale_time = Duration::from_millis(ms);
        }
        if let Some(retry) = env_u64("FETCH_KIT_RETRY")? {
            options.retry = u32::try_from(retry).map_err(|_| {
                Error::ConfigError(format!("FETCH_KIT_RETRY out of range: {}", retry))
            })?;
        }
        if let Some(ms) = env_u64("FETCH_KIT_RETRY_DELAY_MS")? {
            options.retry_delay = Duration::from_millis(ms);
        }

        options.validate();
        Ok(options)
    }

    /// Parse options from a JSON document.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: FetchOptions = serde_json::from_str(json)?;
        options.validate();
        Ok(options)
    }
}

/// Configuration for a [`CacheStore`](crate::store::CacheStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on stored keys; `None` disables eviction.
    pub max_entries: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_entries: Some(DEFAULT_MAX_ENTRIES),
        }
    }
}

impl StoreConfig {
    pub fn unbounded() -> Self {
        StoreConfig { max_entries: None }
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        StoreConfig {
            max_entries: Some(max_entries),
        }
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::ConfigError(format!("{} must be an integer: {}", name, e))),
        Err(_) => Ok(None),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = FetchOptions::default();
        assert_eq!(options.cache_time, Duration::from_secs(300));
        assert_eq!(options.stale_time, Duration::from_secs(30));
        assert_eq!(options.retry, 3);
        assert_eq!(options.retry_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_builder_chaining() {
        let options = FetchOptions::new()
            .with_cache_time(Duration::from_secs(60))
            .with_stale_time(Duration::from_secs(5))
            .with_retry(0)
            .with_retry_delay(Duration::from_millis(250));

        assert_eq!(options.cache_time, Duration::from_secs(60));
        assert_eq!(options.stale_time, Duration::from_secs(5));
        assert_eq!(options.retry, 0);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_linear_backoff() {
        let options = FetchOptions::default();
        assert_eq!(options.retry_delay_for(1), Duration::from_millis(1000));
        assert_eq!(options.retry_delay_for(2), Duration::from_millis(2000));
        assert_eq!(options.retry_delay_for(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let options = FetchOptions::default().with_retry_delay(Duration::from_millis(40));
        let json = serde_json::to_value(&options).expect("Failed to serialize");

        assert_eq!(json["retry_delay_ms"], 40);
        assert_eq!(json["cache_time_ms"], 300_000);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = FetchOptions::from_json(r#"{"retry": "three"}"#);
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("FETCH_KIT_STALE_TIME_MS", "1500");
        std::env::set_var("FETCH_KIT_RETRY", "5");

        let options = FetchOptions::from_env().expect("Failed to load env options");
        assert_eq!(options.stale_time, Duration::from_millis(1500));
        assert_eq!(options.retry, 5);
        assert_eq!(options.cache_time, DEFAULT_CACHE_TIME);

        std::env::set_var("FETCH_KIT_RETRY", "lots");
        assert!(matches!(
            FetchOptions::from_env(),
            Err(Error::ConfigError(_))
        ));

        std::env::remove_var("FETCH_KIT_STALE_TIME_MS");
        std::env::remove_var("FETCH_KIT_RETRY");
    }

    #[test]
    fn test_store_config() {
        assert_eq!(
            StoreConfig::default().max_entries,
            Some(DEFAULT_MAX_ENTRIES)
        );
        assert_eq!(StoreConfig::unbounded().max_entries, None);

        let config: StoreConfig =
            serde_json::from_str(r#"{"max_entries": 8}"#).expect("Failed to parse");
        assert_eq!(config, StoreConfig::with_max_entries(8));
    }
}
