//! # fetch-kit
//!
//! Stale-while-revalidate data fetching for async Rust.
//!
//! ## Features
//!
//! - **Shared cache:** Queries for the same key share one [`CacheStore`]; a
//!   fresh hit never touches the network
//! - **Stale-while-revalidate:** Stale data is served immediately while one
//!   background fetch refreshes it
//! - **Linear retry:** Attempt `n` waits `n * retry_delay`, bounded by `retry`
//! - **Last request wins:** Superseded fetches are cancelled and their late
//!   results discarded; per-key write fencing keeps the store monotonic
//! - **Explicit lifecycle:** Stores are injected, bounded, and can be cleared
//!   per tenant or on logout
//! - **Optimistic updates:** Apply locally, confirm remotely, roll back exactly
//!
//! ## Quick Start
//!
//! ```ignore
//! use fetch_kit::{QueryClient, Error};
//! use serde_json::{json, Value};
//!
//! let client = QueryClient::new();
//!
//! // Mount a query; a miss starts a fetch in the background
//! let stats = client.query("dashboard-stats", || async {
//!     Ok::<Value, Error>(json!({"count": 5}))
//! })?;
//!
//! // Wait for the first result
//! let state = stats.settled().await;
//! assert_eq!(state.data, Some(json!({"count": 5})));
//!
//! // Force a refresh (cancels anything still in flight)
//! stats.refetch(true).await?;
//! ```

#[macro_use]
extern crate log;

pub mod builder;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod observability;
pub mod optimistic;
pub mod options;
pub mod query;
pub mod service;
pub mod state;
pub mod store;
pub mod strategy;

// Re-exports for convenience
pub use builder::QueryBuilder;
pub use error::{Error, Result};
pub use fetcher::QueryFetcher;
pub use observability::{FetchMetrics, NoOpMetrics};
pub use optimistic::{Merge, Optimistic, OptimisticState};
pub use options::{FetchOptions, StoreConfig};
pub use query::Query;
pub use service::QueryClient;
pub use state::FetchState;
pub use store::{CacheLookup, CacheStore, CachedValue, StoreStats};
pub use strategy::{CacheStatus, MountAction};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
