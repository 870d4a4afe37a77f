//! Freshness classification and the mount decision derived from it.
//!
//! # Decision Table
//!
//! | Entry age                        | Status    | Mount action          |
//! |----------------------------------|-----------|-----------------------|
//! | no entry, or `age >= cache_time` | `Missing` | `Fetch` (blocking)    |
//! | `stale_time <= age < cache_time` | `Stale`   | `ServeAndRevalidate`  |
//! | `age < stale_time`               | `Fresh`   | `Serve`               |

use crate::options::FetchOptions;
use std::time::Duration;

/// Freshness of a cache entry relative to a query's options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Younger than `stale_time`: serve without a network call.
    Fresh,

    /// Past `stale_time` but within `cache_time`: serve and refresh.
    Stale,

    /// Absent or past `cache_time`: treated as a miss.
    Missing,
}

impl CacheStatus {
    /// Classify an entry of the given age. `None` means no entry.
    pub fn classify(age: Option<Duration>, options: &FetchOptions) -> Self {
        match age {
            None => CacheStatus::Missing,
            Some(age) if age >= options.cache_time => CacheStatus::Missing,
            Some(age) if age >= options.stale_time => CacheStatus::Stale,
            Some(_) => CacheStatus::Fresh,
        }
    }

    /// What a newly mounted query does for an entry with this status.
    pub fn mount_action(self) -> MountAction {
        match self {
            CacheStatus::Fresh => MountAction::Serve,
            CacheStatus::Stale => MountAction::ServeAndRevalidate,
            CacheStatus::Missing => MountAction::Fetch,
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Fresh => write!(f, "Fresh"),
            CacheStatus::Stale => write!(f, "Stale"),
            CacheStatus::Missing => write!(f, "Missing"),
        }
    }
}

/// Action taken when a query mounts or changes key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountAction {
    /// Serve cached data, no fetch.
    Serve,

    /// Serve cached data and start one background fetch.
    ServeAndRevalidate,

    /// Nothing usable cached: set `loading` and fetch.
    Fetch,
}

impl std::fmt::Display for MountAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountAction::Serve => write!(f, "Serve"),
            MountAction::ServeAndRevalidate => write!(f, "ServeAndRevalidate"),
            MountAction::Fetch => write!(f, "Fetch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options() -> FetchOptions {
        FetchOptions::default()
            .with_cache_time(Duration::from_secs(300))
            .with_stale_time(Duration::from_secs(30))
    }

    #[test]
    fn test_classify_boundaries() {
        let options = options();

        assert_eq!(CacheStatus::classify(None, &options), CacheStatus::Missing);
        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(10)), &options),
            CacheStatus::Fresh
        );
        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(30)), &options),
            CacheStatus::Stale
        );
        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(40)), &options),
            CacheStatus::Stale
        );
        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(300)), &options),
            CacheStatus::Missing
        );
    }

    #[test]
    fn test_mount_action() {
        assert_eq!(CacheStatus::Fresh.mount_action(), MountAction::Serve);
        assert_eq!(
            CacheStatus::Stale.mount_action(),
            MountAction::ServeAndRevalidate
        );
        assert_eq!(CacheStatus::Missing.mount_action(), MountAction::Fetch);
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheStatus::Stale.to_string(), "Stale");
        assert_eq!(MountAction::ServeAndRevalidate.to_string(), "ServeAndRevalidate");
    }

    #[test]
    fn test_stale_time_above_cache_time_never_stale() {
        let options = FetchOptions::default()
            .with_cache_time(Duration::from_secs(10))
            .with_stale_time(Duration::from_secs(20));

        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(5)), &options),
            CacheStatus::Fresh
        );
        assert_eq!(
            CacheStatus::classify(Some(Duration::from_secs(15)), &options),
            CacheStatus::Missing
        );
    }

    proptest! {
        #[test]
        fn prop_classify_matches_thresholds(
            age_ms in 0u64..1_000_000,
            stale_ms in 0u64..500_000,
            extra_ms in 0u64..500_000,
        ) {
            let options = FetchOptions::default()
                .with_stale_time(Duration::from_millis(stale_ms))
                .with_cache_time(Duration::from_millis(stale_ms + extra_ms));
            let status = CacheStatus::classify(Some(Duration::from_millis(age_ms)), &options);

            let expected = if age_ms >= stale_ms + extra_ms {
                CacheStatus::Missing
            } else if age_ms >= stale_ms {
                CacheStatus::Stale
            } else {
                CacheStatus::Fresh
            };
            prop_assert_eq!(status, expected);
        }
    }
}
