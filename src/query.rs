//! Mounted queries - the main entry point for fetching through the cache.
//!
//! A [`Query`] is one consumer's view of a cached resource. Mounting it
//! consults the [`CacheStore`] and decides between serving cached data,
//! serving it while revalidating in the background, or fetching. Dropping
//! the query unmounts it.
//!
//! Every fetch lifecycle owns a [`CancellationToken`]. Starting a new one
//! (key change, forced refetch, background revalidation) cancels the
//! previous token, and every state or cache mutation re-checks the token
//! under the lifecycle lock. The most recently *issued* request wins, no
//! matter in which order the network replies arrive.

use crate::error::{Error, Result};
use crate::fetcher::QueryFetcher;
use crate::key::CacheKeyBuilder;
use crate::observability::{FetchMetrics, NoOpMetrics};
use crate::options::FetchOptions;
use crate::state::FetchState;
use crate::store::{CacheLookup, CacheStore, FetchTicket};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Handle to a mounted query.
///
/// # Example
///
/// ```ignore
/// let store = CacheStore::new();
/// let query = Query::mount(&store, "dashboard-stats", fetch_stats, FetchOptions::default())?;
///
/// let state = query.settled().await;
/// println!("{:?}", state.data);
/// ```
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

struct QueryInner<T> {
    store: CacheStore,
    options: FetchOptions,
    metrics: Arc<dyn FetchMetrics>,
    state: watch::Sender<FetchState<T>>,
    lifecycle: Mutex<Lifecycle<T>>,
    // Cancelled once, on unmount; wakes `settled` waiters.
    unmounted: CancellationToken,
}

struct Lifecycle<T> {
    key: String,
    fetcher: Arc<dyn QueryFetcher<T>>,
    token: CancellationToken,
    retries: u32,
    mounted: bool,
}

/// Everything one fetch lifecycle needs, detached from the lock.
struct FetchRun<T> {
    key: String,
    fetcher: Arc<dyn QueryFetcher<T>>,
    token: CancellationToken,
}

/// Call the fetcher, reporting a panic as a fetch error.
async fn call_fetcher<T: Send + 'static>(fetcher: &Arc<dyn QueryFetcher<T>>) -> Result<T> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch())) {
        Ok(future) => future,
        Err(panic) => return Err(panic_error(panic)),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> Error {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::FetchError(format!("Fetcher panicked: {}", msg))
}

enum Failure {
    Retry(Duration),
    Exhausted(Error),
    Superseded,
}

impl<T> QueryInner<T> {
    fn lock(&self) -> MutexGuard<'_, Lifecycle<T>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unmount(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.mounted {
            lifecycle.mounted = false;
            lifecycle.token.cancel();
            self.unmounted.cancel();
            debug!("Unmounted query {}", lifecycle.key);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueryInner<T> {
    /// Apply the cache decision for the current key.
    fn start(self: &Arc<Self>, lifecycle: &mut Lifecycle<T>) {
        let lookup = self.store.lookup::<T>(&lifecycle.key, &self.options);
        debug!(
            "» Mounting query {} (action: {})",
            lifecycle.key,
            lookup.status().mount_action()
        );

        match lookup {
            CacheLookup::Fresh(cached) => {
                self.metrics.record_hit(&lifecycle.key, cached.age());
                self.state.send_modify(|state| {
                    state.data = Some(cached.value);
                    state.last_fetched = Some(cached.fetched_at);
                    state.loading = false;
                    state.error = None;
                });
            }
            CacheLookup::Stale(cached) => {
                self.metrics.record_stale(&lifecycle.key, cached.age());
                self.state.send_modify(|state| {
                    state.data = Some(cached.value);
                    state.last_fetched = Some(cached.fetched_at);
                });
                self.spawn(lifecycle);
            }
            CacheLookup::Missing => {
                self.metrics.record_miss(&lifecycle.key);
                self.spawn(lifecycle);
            }
        }
    }

    /// Supersede any in-flight fetch and hand out a new lifecycle.
    fn begin(&self, lifecycle: &mut Lifecycle<T>) -> FetchRun<T> {
        lifecycle.token.cancel();
        lifecycle.token = CancellationToken::new();
        lifecycle.retries = 0;

        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });

        FetchRun {
            key: lifecycle.key.clone(),
            fetcher: lifecycle.fetcher.clone(),
            token: lifecycle.token.clone(),
        }
    }

    fn spawn(self: &Arc<Self>, lifecycle: &mut Lifecycle<T>) {
        let run = self.begin(lifecycle);
        tokio::spawn(self.clone().run(run));
    }

    /// Fetch with linear retry until success, exhaustion or cancellation.
    async fn run(self: Arc<Self>, run: FetchRun<T>) -> Result<Option<T>> {
        loop {
            if run.token.is_cancelled() {
                return Ok(None);
            }

            let ticket = self.store.begin_fetch(&run.key);
            let started = Instant::now();

            match call_fetcher(&run.fetcher).await {
                Ok(value) => return Ok(self.succeed(&run, &ticket, value, started.elapsed())),
                Err(err) => match self.fail(&run, err) {
                    Failure::Retry(delay) => {
                        tokio::select! {
                            _ = run.token.cancelled() => return Ok(None),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Failure::Exhausted(err) => return Err(err),
                    Failure::Superseded => return Ok(None),
                },
            }
        }
    }

    fn succeed(
        &self,
        run: &FetchRun<T>,
        ticket: &FetchTicket,
        value: T,
        elapsed: Duration,
    ) -> Option<T> {
        let mut lifecycle = self.lock();
        if run.token.is_cancelled() || !lifecycle.mounted {
            self.metrics.record_discarded(&run.key);
            debug!("✗ Discarding superseded result for {}", run.key);
            return None;
        }

        lifecycle.retries = 0;
        if !self.store.commit(ticket, value.clone()) {
            self.metrics.record_discarded(&run.key);
        }

        let data = value.clone();
        self.state.send_modify(|state| {
            state.data = Some(data);
            state.last_fetched = Some(Instant::now());
            state.loading = false;
            state.error = None;
        });

        self.metrics.record_fetch(&run.key, elapsed);
        info!("✓ Fetched {} in {:?}", run.key, elapsed);
        Some(value)
    }

    fn fail(&self, run: &FetchRun<T>, err: Error) -> Failure {
        let mut lifecycle = self.lock();
        if run.token.is_cancelled() || !lifecycle.mounted {
            debug!("✗ Ignoring failure of superseded fetch for {}: {}", run.key, err);
            return Failure::Superseded;
        }

        if lifecycle.retries < self.options.retry {
            lifecycle.retries += 1;
            let attempt = lifecycle.retries;
            let delay = self.options.retry_delay_for(attempt);
            warn!(
                "Fetch for {} failed (retry {}/{} in {:?}): {}",
                run.key, attempt, self.options.retry, delay, err
            );
            self.metrics.record_retry(&run.key, attempt, delay);
            return Failure::Retry(delay);
        }

        lifecycle.retries = 0;
        let reported = err.clone();
        self.state.send_modify(|state| {
            state.error = Some(reported);
            state.loading = false;
        });

        self.metrics.record_error(&run.key, &err);
        warn!(
            "✗ Fetch for {} failed after {} retries: {}",
            run.key, self.options.retry, err
        );
        Failure::Exhausted(err)
    }
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
    /// Mount a query for `key` backed by `store`.
    ///
    /// Fresh cached data is served synchronously. Otherwise a fetch is
    /// spawned on the current tokio runtime.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an empty key.
    ///
    /// # Panics
    /// Panics if a fetch must be spawned outside a tokio runtime.
    pub fn mount(
        store: &CacheStore,
        key: impl Into<String>,
        fetcher: impl QueryFetcher<T>,
        options: FetchOptions,
    ) -> Result<Self> {
        Self::mount_with_metrics(store, key, fetcher, options, Arc::new(NoOpMetrics))
    }

    /// Same as [`Query::mount`], reporting events to `metrics`.
    pub fn mount_with_metrics(
        store: &CacheStore,
        key: impl Into<String>,
        fetcher: impl QueryFetcher<T>,
        options: FetchOptions,
        metrics: Arc<dyn FetchMetrics>,
    ) -> Result<Self> {
        let key = key.into();
        CacheKeyBuilder::validate(&key)?;
        options.validate();

        let (state, _) = watch::channel(FetchState::default());
        let inner = Arc::new(QueryInner {
            store: store.clone(),
            options,
            metrics,
            state,
            lifecycle: Mutex::new(Lifecycle {
                key,
                fetcher: Arc::new(fetcher),
                token: CancellationToken::new(),
                retries: 0,
                mounted: true,
            }),
            unmounted: CancellationToken::new(),
        });

        {
            let mut lifecycle = inner.lock();
            inner.start(&mut lifecycle);
        }

        Ok(Query { inner })
    }

    /// Refetch the current key.
    ///
    /// With `force == false` and fresh cached data this resolves immediately
    /// with the cached value and issues no call. Otherwise it supersedes any
    /// in-flight fetch and starts a new one.
    ///
    /// Returns `Ok(Some(value))` on success and `Ok(None)` if this fetch was
    /// itself superseded or the query unmounted before it finished.
    ///
    /// # Errors
    /// Returns the last failure once the retry budget is exhausted, or
    /// `Error::Unmounted` when called on an unmounted query.
    pub async fn refetch(&self, force: bool) -> Result<Option<T>> {
        let run = {
            let mut lifecycle = self.inner.lock();
            if !lifecycle.mounted {
                return Err(Error::Unmounted);
            }

            if !force {
                if let CacheLookup::Fresh(cached) =
                    self.inner.store.lookup::<T>(&lifecycle.key, &self.inner.options)
                {
                    debug!("Refetch of {} served from fresh cache", lifecycle.key);
                    return Ok(Some(cached.value));
                }
            }

            self.inner.begin(&mut lifecycle)
        };

        // Run detached so the lifecycle completes even if the caller stops waiting.
        match tokio::spawn(self.inner.clone().run(run)).await {
            Ok(result) => result,
            Err(e) => Err(Error::FetchError(format!("Fetch task aborted: {}", e))),
        }
    }

    /// Switch to a different resource. Starts a new lifecycle exactly like a
    /// fresh mount; data from the previous key is dropped.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an empty key and
    /// `Error::Unmounted` on an unmounted query.
    pub fn set_key(&self, key: impl Into<String>, fetcher: impl QueryFetcher<T>) -> Result<()> {
        let key = key.into();
        CacheKeyBuilder::validate(&key)?;

        let mut lifecycle = self.inner.lock();
        if !lifecycle.mounted {
            return Err(Error::Unmounted);
        }

        debug!("Query key change {} -> {}", lifecycle.key, key);
        lifecycle.token.cancel();
        lifecycle.key = key;
        lifecycle.fetcher = Arc::new(fetcher);
        lifecycle.retries = 0;
        self.inner.state.send_replace(FetchState::default());

        self.inner.start(&mut lifecycle);
        Ok(())
    }

    /// Wait until no fetch is outstanding and return the resulting state.
    ///
    /// Returns the last observed state right away once the query is unmounted.
    pub async fn settled(&self) -> FetchState<T> {
        let mut rx = self.inner.state.subscribe();
        let settled = tokio::select! {
            changed = rx.wait_for(|state| !state.loading) => match changed {
                Ok(state) => Some((*state).clone()),
                Err(_) => None,
            },
            _ = self.inner.unmounted.cancelled() => None,
        };
        settled.unwrap_or_else(|| self.state())
    }

    /// Current state snapshot.
    pub fn state(&self) -> FetchState<T> {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.inner.state.subscribe()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.state.borrow().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn last_fetched(&self) -> Option<Instant> {
        self.inner.state.borrow().last_fetched
    }

    /// Whether the shown data is older than `stale_time`.
    pub fn is_stale(&self) -> bool {
        self.inner.state.borrow().is_stale(self.inner.options.stale_time)
    }

    pub fn key(&self) -> String {
        self.inner.lock().key.clone()
    }

    pub fn options(&self) -> &FetchOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.lock().mounted
    }

    /// Cancel in-flight work; no state changes are observed afterwards.
    ///
    /// Later `refetch` and `set_key` calls fail with `Error::Unmounted`.
    /// Dropping the query unmounts it as well.
    pub fn unmount(&self) {
        self.inner.unmount();
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        self.inner.unmount();
    }
}
