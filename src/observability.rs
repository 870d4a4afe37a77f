//! Metrics hooks for query and cache activity.
//!
//! Implement [`FetchMetrics`] to forward events to Prometheus, StatsD or
//! anything else. Every method has a no-op default, so implementors only
//! override what they care about.

use crate::error::Error;
use std::time::Duration;

/// Sink for query lifecycle events.
pub trait FetchMetrics: Send + Sync {
    /// Fresh cached data was served without a network call.
    fn record_hit(&self, _key: &str, _age: Duration) {}

    /// Stale cached data was served and a background refresh started.
    fn record_stale(&self, _key: &str, _age: Duration) {}

    /// Nothing usable was cached.
    fn record_miss(&self, _key: &str) {}

    /// A fetch attempt succeeded after `duration`.
    fn record_fetch(&self, _key: &str, _duration: Duration) {}

    /// Retry number `attempt` was scheduled after `delay`.
    fn record_retry(&self, _key: &str, _attempt: u32, _delay: Duration) {}

    /// The retry budget was exhausted.
    fn record_error(&self, _key: &str, _error: &Error) {}

    /// A superseded or fenced-off result was discarded.
    fn record_discarded(&self, _key: &str) {}
}

/// Default metrics sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl FetchMetrics for NoOpMetrics {}
