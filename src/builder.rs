//! Builder pattern for mounting queries with per-query options.

use crate::error::Result;
use crate::fetcher::QueryFetcher;
use crate::options::FetchOptions;
use crate::query::Query;
use crate::service::QueryClient;
use std::time::Duration;

/// Fluent builder for a single query.
///
/// Starts from the client's default options; each setter overrides one field
/// for this query only.
///
/// # Example
///
/// ```ignore
/// let query = client
///     .builder("dashboard-stats")
///     .stale_time(Duration::from_secs(10))
///     .retry(5)
///     .mount(fetch_stats)?;
/// ```
pub struct QueryBuilder<'a> {
    client: &'a QueryClient,
    key: String,
    options: FetchOptions,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(client: &'a QueryClient, key: String) -> Self {
        Self {
            client,
            key,
            options: client.default_options().clone(),
        }
    }

    /// Maximum age at which cached data is served at all.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.options.cache_time = cache_time;
        self
    }

    /// Age after which cached data is revalidated in the background.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options.stale_time = stale_time;
        self
    }

    /// Retries after the initial failure.
    ///
    /// ```ignore
    /// builder.retry(0)  // Fail on the first error
    /// ```
    pub fn retry(mut self, retry: u32) -> Self {
        self.options.retry = retry;
        self
    }

    /// Linear backoff unit: retry `n` waits `n * retry_delay`.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.options.retry_delay = retry_delay;
        self
    }

    /// Replace all options at once.
    pub fn options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Options the query will be mounted with.
    pub fn current_options(&self) -> &FetchOptions {
        &self.options
    }

    /// Mount the query.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an empty key.
    pub fn mount<T, F>(self, fetcher: F) -> Result<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: QueryFetcher<T>,
    {
        Query::mount_with_metrics(
            self.client.store(),
            self.key,
            fetcher,
            self.options,
            self.client.metrics(),
        )
    }
}
