//! High-level query client for application code.
//!
//! [`QueryClient`] bundles a [`CacheStore`], default [`FetchOptions`] and a
//! metrics sink. It is cheap to clone, so a web handler, a background job
//! and a dashboard view can all hold one and share cached data.
//!
//! # Example
//!
//! ```ignore
//! use fetch_kit::QueryClient;
//!
//! let client = QueryClient::new();
//! let stats = client.query("tenant-42:dashboard-stats", move || {
//!     let api = api.clone();
//!     async move { api.dashboard_stats().await.map_err(fetch_kit::Error::fetch) }
//! })?;
//!
//! // On logout or tenant switch
//! client.clear();
//! ```

use crate::builder::QueryBuilder;
use crate::error::Result;
use crate::fetcher::QueryFetcher;
use crate::observability::{FetchMetrics, NoOpMetrics};
use crate::options::{FetchOptions, StoreConfig};
use crate::query::Query;
use crate::store::{CacheLookup, CacheStore, StoreStats};
use std::sync::Arc;

/// Shared entry point for mounting queries against one store.
#[derive(Clone)]
pub struct QueryClient {
    store: CacheStore,
    options: FetchOptions,
    metrics: Arc<dyn FetchMetrics>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Client with a fresh default store and default options.
    pub fn new() -> Self {
        Self::with_store(CacheStore::new())
    }

    /// Client sharing an existing store.
    pub fn with_store(store: CacheStore) -> Self {
        QueryClient {
            store,
            options: FetchOptions::default(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Client configured from `FETCH_KIT_*` environment variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is malformed.
    pub fn from_env() -> Result<Self> {
        let options = FetchOptions::from_env()?;
        Ok(Self::with_store(CacheStore::with_config(StoreConfig::default())).with_options(options))
    }

    /// Set default options for queries mounted through this client.
    pub fn with_options(mut self, options: FetchOptions) -> Self {
        options.validate();
        self.options = options;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn FetchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn default_options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn metrics(&self) -> Arc<dyn FetchMetrics> {
        self.metrics.clone()
    }

    /// Mount a query with the client's default options.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an empty key.
    pub fn query<T, F>(&self, key: impl Into<String>, fetcher: F) -> Result<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: QueryFetcher<T>,
    {
        self.builder(key).mount(fetcher)
    }

    /// Builder for a query with per-query options.
    pub fn builder(&self, key: impl Into<String>) -> QueryBuilder<'_> {
        QueryBuilder::new(self, key.into())
    }

    /// Warm the store for `key` without mounting a query.
    ///
    /// Fresh cached data is returned as is. Otherwise the fetcher runs with
    /// the client's retry policy and a successful result is written through.
    ///
    /// # Errors
    /// Returns the last failure once the retry budget is exhausted.
    pub async fn prefetch<T, F>(&self, key: &str, fetcher: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: QueryFetcher<T>,
    {
        crate::key::CacheKeyBuilder::validate(key)?;

        if let CacheLookup::Fresh(cached) = self.store.lookup::<T>(key, &self.options) {
            debug!("Prefetch of {} skipped, cache is fresh", key);
            return Ok(cached.value);
        }

        let mut attempts = 0;
        loop {
            let ticket = self.store.begin_fetch(key);
            match fetcher.fetch().await {
                Ok(value) => {
                    if !self.store.commit(&ticket, value.clone()) {
                        self.metrics.record_discarded(key);
                    }
                    debug!("✓ Prefetched {}", key);
                    return Ok(value);
                }
                Err(e) => {
                    if attempts >= self.options.retry {
                        self.metrics.record_error(key, &e);
                        return Err(e);
                    }

                    attempts += 1;
                    let delay = self.options.retry_delay_for(attempts);
                    debug!(
                        "Prefetch of {} failed (retry {}/{}), retrying in {:?}",
                        key, attempts, self.options.retry, delay
                    );
                    self.metrics.record_retry(key, attempts, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Write a value directly, e.g. after a mutation returned the new record.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.store.set(key, value);
    }

    /// Read the cached value for `key` regardless of its age.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the key holds another type.
    pub fn get_query_data<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.store.get::<T>(key)?.map(|cached| cached.value))
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.store.invalidate(key)
    }

    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.store.invalidate_namespace(namespace)
    }

    /// Drop all cached data (logout, tenant switch).
    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}
