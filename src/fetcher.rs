//! Fetch function abstraction.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;

/// Source of a query's data.
///
/// The query never interprets the value and never swallows a failure: every
/// `Err` is either retried or reported through the query state.
///
/// Any zero-argument closure returning a `Send` future implements it:
///
/// ```
/// use fetch_kit::QueryFetcher;
///
/// fn assert_fetcher<F: QueryFetcher<u32>>(_: F) {}
///
/// assert_fetcher(|| async { Ok::<u32, fetch_kit::Error>(5) });
/// ```
pub trait QueryFetcher<T>: Send + Sync + 'static {
    /// Perform one fetch attempt.
    fn fetch(&self) -> BoxFuture<'static, Result<T>>;
}

impl<T, F, Fut> QueryFetcher<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'static, Result<T>> {
        Box::pin((self)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StatsRepository {
        calls: Arc<AtomicUsize>,
    }

    impl QueryFetcher<u64> for StatsRepository {
        fn fetch(&self) -> BoxFuture<'static, Result<u64>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            Box::pin(async move { Ok::<u64, Error>(n * 10) })
        }
    }

    #[tokio::test]
    async fn test_closure_fetcher() {
        let fetcher = || async { Ok::<_, Error>("stats".to_string()) };
        assert_eq!(fetcher.fetch().await.expect("Fetch failed"), "stats");
    }

    #[tokio::test]
    async fn test_closure_fetcher_propagates_error() {
        let fetcher = || async { Err::<u32, _>(Error::fetch("502 Bad Gateway")) };
        assert_eq!(
            fetcher.fetch().await,
            Err(Error::FetchError("502 Bad Gateway".to_string()))
        );
    }

    #[tokio::test]
    async fn test_struct_fetcher() {
        let calls = Arc::new(AtomicUsize::new(0));
        let repo = StatsRepository {
            calls: calls.clone(),
        };

        assert_eq!(repo.fetch().await.expect("Fetch failed"), 0);
        assert_eq!(repo.fetch().await.expect("Fetch failed"), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
