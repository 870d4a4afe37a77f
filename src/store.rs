//! Shared cache store.
//!
//! A [`CacheStore`] is an explicit registry handed to every query that should
//! share data. Clones are cheap and point at the same map, so a host can keep
//! one store per tenant and drop or [`clear`](CacheStore::clear) it on logout.
//!
//! Values are type-erased. A query for `T` reads back a clone of the `T`
//! written under the same key; reading a key with a different type is a
//! [`Error::TypeMismatch`].
//!
//! # Write fencing
//!
//! Every fetch takes a [`FetchTicket`] before calling out. Tickets carry a
//! sequence number that grows monotonically across the store. A commit is
//! applied only if no later-issued request has already written the key, and
//! only if the key was not invalidated (or the store cleared) after the
//! ticket was issued. Out-of-order completions from different queries
//! therefore never move a key back to older data.
//!
//! Removing a value (eviction, sweep, invalidation) leaves a tombstone that
//! remembers the key's fence. Tombstones are capped like entries; when the
//! oldest ones are pruned the store-wide floor is raised past their fences,
//! so an older ticket is still rejected.

use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::options::{FetchOptions, StoreConfig, DEFAULT_MAX_ENTRIES};
use crate::strategy::CacheStatus;
use dashmap::DashMap;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type AnyValue = Arc<dyn Any + Send + Sync>;

/// One stored value.
#[derive(Clone)]
pub struct CacheEntry {
    pub key: String,
    value: AnyValue,
    pub fetched_at: Instant,
    seq: u64,
}

impl CacheEntry {
    /// Time since the value was written.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    fn downcast<T: Clone + 'static>(&self) -> Result<T> {
        self.value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch {
                key: self.key.clone(),
                expected: std::any::type_name::<T>(),
            })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("fetched_at", &self.fetched_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// A typed copy of a cached value and the moment it was fetched.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub fetched_at: Instant,
}

impl<T> CachedValue<T> {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Result of classifying a key against a query's options.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup<T> {
    Fresh(CachedValue<T>),
    Stale(CachedValue<T>),
    Missing,
}

impl<T> CacheLookup<T> {
    pub fn status(&self) -> CacheStatus {
        match self {
            CacheLookup::Fresh(_) => CacheStatus::Fresh,
            CacheLookup::Stale(_) => CacheStatus::Stale,
            CacheLookup::Missing => CacheStatus::Missing,
        }
    }

    pub fn into_cached(self) -> Option<CachedValue<T>> {
        match self {
            CacheLookup::Fresh(cached) | CacheLookup::Stale(cached) => Some(cached),
            CacheLookup::Missing => None,
        }
    }
}

/// Permission to write one fetch result back to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    key: String,
    seq: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Point-in-time store counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub discarded_writes: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    discarded_writes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    // Tickets issued at or before this sequence may not write.
    fence: u64,
}

impl Slot {
    /// Drop the value but keep its sequence as the fence.
    fn retire(&mut self) -> bool {
        match self.entry.take() {
            Some(entry) => {
                self.fence = self.fence.max(entry.seq);
                true
            }
            None => false,
        }
    }
}

struct StoreInner {
    slots: DashMap<String, Slot>,
    seq: AtomicU64,
    // Tickets issued at or before this sequence may not write any key.
    floor: AtomicU64,
    counters: Counters,
    config: StoreConfig,
}

/// Process-wide (or tenant-wide) key → value registry shared by queries.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Create an empty store with the default size bound.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        debug!("Creating cache store (max_entries: {:?})", config.max_entries);
        CacheStore {
            inner: Arc::new(StoreInner {
                slots: DashMap::new(),
                seq: AtomicU64::new(0),
                floor: AtomicU64::new(0),
                counters: Counters::default(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    /// Read the raw entry for `key`.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner
            .slots
            .get(key)
            .and_then(|slot| slot.entry.clone())
    }

    /// Read a typed copy of the value stored under `key`.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the stored value is not a `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<Option<CachedValue<T>>> {
        match self.entry(key) {
            Some(entry) => Ok(Some(CachedValue {
                value: entry.downcast::<T>()?,
                fetched_at: entry.fetched_at,
            })),
            None => Ok(None),
        }
    }

    /// Classify `key` for a query with `options` and return its value if usable.
    ///
    /// Expired entries and entries of the wrong type count as misses.
    pub fn lookup<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        options: &FetchOptions,
    ) -> CacheLookup<T> {
        let cached = match self.get::<T>(key) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("⚠ Ignoring cache entry: {}", e);
                None
            }
        };

        let status = CacheStatus::classify(cached.as_ref().map(|c| c.age()), options);
        let lookup = match (status, cached) {
            (CacheStatus::Fresh, Some(cached)) => CacheLookup::Fresh(cached),
            (CacheStatus::Stale, Some(cached)) => CacheLookup::Stale(cached),
            _ => CacheLookup::Missing,
        };

        match lookup {
            CacheLookup::Missing => self.inner.counters.misses.fetch_add(1, Ordering::Relaxed),
            _ => self.inner.counters.hits.fetch_add(1, Ordering::Relaxed),
        };
        debug!("Cache lookup for {} -> {}", key, lookup.status());
        lookup
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        let seq = self.next_seq();
        self.write(key, Arc::new(value), seq);
    }

    /// Issue a write ticket for a fetch that is about to start.
    pub fn begin_fetch(&self, key: &str) -> FetchTicket {
        FetchTicket {
            key: key.to_string(),
            seq: self.next_seq(),
        }
    }

    /// Write a fetch result if its ticket is still the newest for the key.
    ///
    /// Returns `false` when the write was discarded.
    pub fn commit<T: Send + Sync + 'static>(&self, ticket: &FetchTicket, value: T) -> bool {
        if ticket.seq <= self.inner.floor.load(Ordering::SeqCst) {
            return self.discard(ticket, "store cleared after ticket was issued");
        }

        let accepted = {
            let mut slot = self.inner.slots.entry(ticket.key.clone()).or_default();
            let newer_committed = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.seq > ticket.seq);
            if ticket.seq <= slot.fence || newer_committed {
                false
            } else {
                slot.entry = Some(CacheEntry {
                    key: ticket.key.clone(),
                    value: Arc::new(value),
                    fetched_at: Instant::now(),
                    seq: ticket.seq,
                });
                true
            }
        };

        if !accepted {
            return self.discard(ticket, "newer write or invalidation");
        }

        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!("✓ Cache SET {} (seq {})", ticket.key, ticket.seq);
        self.enforce_bound();
        true
    }

    fn discard(&self, ticket: &FetchTicket, reason: &str) -> bool {
        self.inner
            .counters
            .discarded_writes
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "✗ Discarding write for {} (seq {}): {}",
            ticket.key, ticket.seq, reason
        );
        false
    }

    fn write(&self, key: &str, value: AnyValue, seq: u64) {
        {
            let mut slot = self.inner.slots.entry(key.to_string()).or_default();
            slot.entry = Some(CacheEntry {
                key: key.to_string(),
                value,
                fetched_at: Instant::now(),
                seq,
            });
        }
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!("✓ Cache SET {}", key);
        self.enforce_bound();
    }

    fn enforce_bound(&self) {
        let Some(max) = self.inner.config.max_entries else {
            return;
        };

        while self.len() > max {
            let oldest = self
                .inner
                .slots
                .iter()
                .filter_map(|slot| {
                    slot.entry
                        .as_ref()
                        .map(|entry| (slot.key().clone(), entry.fetched_at))
                })
                .min_by_key(|(_, fetched_at)| *fetched_at)
                .map(|(key, _)| key);

            let Some(key) = oldest else {
                break;
            };
            let evicted = self
                .inner
                .slots
                .get_mut(&key)
                .is_some_and(|mut slot| slot.retire());
            if evicted {
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted {} (store bound {})", key, max);
            }
        }

        self.prune_tombstones();
    }

    /// Keep at most as many tombstones as the entry bound allows.
    ///
    /// The floor is raised before a tombstone is removed, so there is no
    /// window in which its fence is forgotten.
    fn prune_tombstones(&self) {
        let cap = self.inner.config.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        let mut tombstones: Vec<(String, u64)> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.entry.is_none())
            .map(|slot| (slot.key().clone(), slot.fence))
            .collect();
        if tombstones.len() <= cap {
            return;
        }

        tombstones.sort_by_key(|(_, fence)| *fence);
        let excess = tombstones.len() - cap;
        for (key, fence) in tombstones.into_iter().take(excess) {
            self.inner.floor.fetch_max(fence, Ordering::SeqCst);
            self.inner
                .slots
                .remove_if(&key, |_, slot| slot.entry.is_none());
        }
        debug!("Pruned {} tombstones (cap {})", excess, cap);
    }

    /// Number of slots held, including tombstones.
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Remove `key`. Fetches already in flight for it will not write back.
    pub fn invalidate(&self, key: &str) -> bool {
        let fence = self.current_seq();
        let existed = {
            let mut slot = self.inner.slots.entry(key.to_string()).or_default();
            let existed = slot.retire();
            slot.fence = slot.fence.max(fence);
            existed
        };
        debug!("Invalidated {} (existed: {})", key, existed);
        self.prune_tombstones();
        existed
    }

    /// Remove every key under `namespace` (see [`CacheKeyBuilder`]).
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let prefix = CacheKeyBuilder::namespace_prefix(namespace);
        let keys: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();

        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    /// Drop everything. In-flight fetches issued before the clear are fenced off.
    pub fn clear(&self) {
        self.inner.floor.fetch_max(self.current_seq(), Ordering::SeqCst);
        self.inner.slots.clear();
        info!("Cache store cleared");
    }

    /// Remove entries older than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        for mut slot in self.inner.slots.iter_mut() {
            let expired = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.age() >= max_age);
            if expired && slot.retire() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Swept {} entries older than {:?}", removed, max_age);
            self.prune_tombstones();
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.entry.is_some())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let counters = &self.inner.counters;
        StoreStats {
            entries: self.len(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
            discarded_writes: counters.discarded_writes.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct DashboardStats {
        leads: u32,
        calls: u32,
    }

    fn options() -> FetchOptions {
        FetchOptions::default()
            .with_cache_time(Duration::from_secs(300))
            .with_stale_time(Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_and_get() {
        let store = CacheStore::new();
        store.set("dashboard-stats", DashboardStats { leads: 3, calls: 9 });

        let cached = store
            .get::<DashboardStats>("dashboard-stats")
            .expect("Failed to get")
            .expect("Entry missing");
        assert_eq!(cached.value, DashboardStats { leads: 3, calls: 9 });
        assert_eq!(cached.age(), Duration::ZERO);
        assert!(store.get::<DashboardStats>("other").expect("Failed to get").is_none());
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let store = CacheStore::new();
        store.set("dashboard-stats", 5u32);

        let result = store.get::<String>("dashboard-stats");
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));

        // Mismatched entries are misses for lookups
        assert_eq!(
            store.lookup::<String>("dashboard-stats", &options()),
            CacheLookup::Missing
        );
    }

    #[tokio::test]
    async fn test_set_overwrites_last_writer_wins() {
        let store = CacheStore::new();
        store.set("k", 1u32);
        store.set("k", 2u32);

        assert_eq!(store.get::<u32>("k").expect("get").expect("entry").value, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_ages() {
        let store = CacheStore::new();
        store.set("k", 7u32);

        assert!(matches!(store.lookup::<u32>("k", &options()), CacheLookup::Fresh(_)));

        tokio::time::advance(Duration::from_secs(40)).await;
        match store.lookup::<u32>("k", &options()) {
            CacheLookup::Stale(cached) => assert_eq!(cached.value, 7),
            other => panic!("Expected stale lookup, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(store.lookup::<u32>("k", &options()), CacheLookup::Missing);

        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_commit_discards_older_ticket() {
        let store = CacheStore::new();
        let older = store.begin_fetch("k");
        let newer = store.begin_fetch("k");

        assert!(store.commit(&newer, "new".to_string()));
        assert!(!store.commit(&older, "old".to_string()));

        assert_eq!(store.get::<String>("k").expect("get").expect("entry").value, "new");
        assert_eq!(store.stats().discarded_writes, 1);
    }

    #[tokio::test]
    async fn test_commit_in_issue_order() {
        let store = CacheStore::new();
        let older = store.begin_fetch("k");
        let newer = store.begin_fetch("k");

        assert!(store.commit(&older, 1u32));
        assert!(store.commit(&newer, 2u32));
        assert_eq!(store.get::<u32>("k").expect("get").expect("entry").value, 2);
    }

    #[tokio::test]
    async fn test_invalidate_fences_in_flight_fetch() {
        let store = CacheStore::new();
        store.set("k", 1u32);
        let ticket = store.begin_fetch("k");

        assert!(store.invalidate("k"));
        assert!(!store.contains("k"));
        assert!(!store.commit(&ticket, 2u32));

        // A fetch started after invalidation may write
        let ticket = store.begin_fetch("k");
        assert!(store.commit(&ticket, 3u32));
        assert_eq!(store.get::<u32>("k").expect("get").expect("entry").value, 3);
    }

    #[tokio::test]
    async fn test_clear_fences_in_flight_fetch() {
        let store = CacheStore::new();
        store.set("tenant-1:stats", 1u32);
        let ticket = store.begin_fetch("tenant-1:leads");

        store.clear();
        assert!(store.is_empty());
        assert!(!store.commit(&ticket, 2u32));
    }

    #[tokio::test]
    async fn test_invalidate_namespace() {
        let store = CacheStore::new();
        store.set("tenant-1:stats", 1u32);
        store.set("tenant-1:leads", 2u32);
        store.set("tenant-2:stats", 3u32);

        assert_eq!(store.invalidate_namespace("tenant-1"), 2);
        assert_eq!(store.keys(), vec!["tenant-2:stats".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_store_evicts_oldest() {
        let store = CacheStore::with_config(StoreConfig::with_max_entries(2));
        store.set("a", 1u32);
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("b", 2u32);
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("c", 3u32);

        assert_eq!(store.len(), 2);
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert!(store.contains("c"));
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_fence_for_older_ticket() {
        let store = CacheStore::with_config(StoreConfig::with_max_entries(1));
        let older = store.begin_fetch("k");
        let newer = store.begin_fetch("k");
        assert!(store.commit(&newer, "new".to_string()));

        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("other", 1u32);
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("k2", 2u32);
        assert!(!store.contains("k"));

        assert!(!store.commit(&older, "old".to_string()));
        assert!(!store.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fence_for_older_ticket() {
        let store = CacheStore::with_config(StoreConfig::unbounded());
        let older = store.begin_fetch("k");
        let newer = store.begin_fetch("k");
        assert!(store.commit(&newer, 2u32));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(store.sweep(Duration::from_secs(60)), 1);

        assert!(!store.commit(&older, 1u32));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_are_bounded() {
        let store = CacheStore::with_config(StoreConfig::with_max_entries(4));
        for i in 0..10_000 {
            store.invalidate(&format!("lead-{}", i));
        }

        assert_eq!(store.len(), 0);
        assert!(store.slot_count() <= 4);
    }

    #[tokio::test]
    async fn test_pruned_tombstone_still_fences() {
        let store = CacheStore::with_config(StoreConfig::with_max_entries(2));
        let ticket = store.begin_fetch("k");
        store.invalidate("k");

        // Push the tombstone for "k" out
        for i in 0..5 {
            store.invalidate(&format!("other-{}", i));
        }
        assert!(store.slot_count() <= 2);
        assert!(!store.commit(&ticket, 1u32));

        // Fetches issued afterwards still write
        let ticket = store.begin_fetch("k");
        assert!(store.commit(&ticket, 2u32));
        assert_eq!(store.get::<u32>("k").expect("get").expect("entry").value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep() {
        let store = CacheStore::with_config(StoreConfig::unbounded());
        store.set("old", 1u32);
        tokio::time::advance(Duration::from_secs(120)).await;
        store.set("new", 2u32);

        assert_eq!(store.sweep(Duration::from_secs(60)), 1);
        assert_eq!(store.keys(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = CacheStore::new();
        let other = store.clone();
        store.set("k", 1u32);

        assert!(other.contains("k"));
        assert_eq!(other.stats().writes, 1);
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(StoreStats::default()).expect("Failed to serialize");
        assert_eq!(json["discarded_writes"], 0);
    }
}
