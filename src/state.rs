//! Observable per-query state.

use crate::error::Error;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of a query as seen by its consumers.
///
/// `data` survives failures: after an exhausted retry budget the last good
/// value is still present next to `error`.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchState<T> {
    /// Last known value, from the cache or a fetch.
    pub data: Option<T>,

    /// A fetch this query is waiting on is in flight.
    pub loading: bool,

    /// Failure of the most recent completed fetch; cleared on every new attempt.
    pub error: Option<Error>,

    /// When `data` was fetched.
    pub last_fetched: Option<Instant>,
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        FetchState {
            data: None,
            loading: false,
            error: None,
            last_fetched: None,
        }
    }
}

impl<T> FetchState<T> {
    /// Age of `data`, if any.
    pub fn age(&self) -> Option<Duration> {
        self.last_fetched.map(|at| at.elapsed())
    }

    /// Whether `data` has reached `stale_time`. Never stored, always derived.
    ///
    /// Uses the same boundary as [`CacheStatus::classify`](crate::strategy::CacheStatus::classify):
    /// data exactly `stale_time` old is stale.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.age().is_some_and(|age| age >= stale_time)
    }

    /// Whether the query has nothing to show and is not working on it.
    pub fn is_idle(&self) -> bool {
        self.data.is_none() && !self.loading && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FetchOptions;
    use crate::strategy::CacheStatus;

    #[test]
    fn test_default_state() {
        let state = FetchState::<u32>::default();
        assert!(state.is_idle());
        assert_eq!(state.age(), None);
        assert!(!state.is_stale(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_is_derived_from_last_fetched() {
        let state = FetchState {
            data: Some(5u32),
            loading: false,
            error: None,
            last_fetched: Some(Instant::now()),
        };
        let stale_time = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!state.is_stale(stale_time));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(state.is_stale(stale_time));
        assert_eq!(state.age(), Some(Duration::from_secs(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_boundary_matches_classifier() {
        let options = FetchOptions::default().with_stale_time(Duration::from_secs(30));
        let state = FetchState {
            data: Some(5u32),
            loading: false,
            error: None,
            last_fetched: Some(Instant::now()),
        };

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(state.is_stale(options.stale_time));
        assert_eq!(
            CacheStatus::classify(state.age(), &options),
            CacheStatus::Stale
        );
    }
}
