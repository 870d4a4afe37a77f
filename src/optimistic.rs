//! Optimistic updates with full rollback.
//!
//! [`Optimistic`] applies a change locally before the server confirms it.
//! On success the local value is replaced by what the server returned; on
//! failure the exact pre-update snapshot is restored and the error recorded.
//!
//! Updates on one helper run one at a time. A second `update` waits for the
//! first to settle, so every rollback restores the snapshot its own update
//! captured. An update whose future is dropped before it settles (timeout,
//! `select!`) also restores its snapshot.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Merge a partial change into a value.
pub trait Merge<P> {
    fn merge(&mut self, patch: P);
}

/// Shallow object merge: keys in `patch` overwrite keys in `self`.
/// Anything other than object-into-object replaces the value.
impl Merge<Value> for Value {
    fn merge(&mut self, patch: Value) {
        match (self, patch) {
            (Value::Object(target), Value::Object(patch)) => {
                for (key, value) in patch {
                    target.insert(key, value);
                }
            }
            (target, patch) => *target = patch,
        }
    }
}

/// Observable state of an [`Optimistic`] helper.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimisticState<T> {
    pub data: T,
    pub is_updating: bool,
    pub error: Option<Error>,
}

/// An applied candidate that has not been confirmed yet.
///
/// Dropping it without [`confirm`](Self::confirm) or
/// [`roll_back`](Self::roll_back) restores the snapshot.
struct PendingUpdate<'a, T> {
    state: &'a watch::Sender<OptimisticState<T>>,
    snapshot: Option<T>,
}

impl<T> PendingUpdate<'_, T> {
    fn confirm(mut self, data: T) {
        self.snapshot = None;
        self.state.send_modify(|state| {
            state.data = data;
            state.is_updating = false;
        });
    }

    fn roll_back(mut self, error: Error) {
        if let Some(snapshot) = self.snapshot.take() {
            self.state.send_modify(|state| {
                state.data = snapshot;
                state.is_updating = false;
                state.error = Some(error);
            });
        }
    }
}

impl<T> Drop for PendingUpdate<'_, T> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.state.send_modify(|state| {
                state.data = snapshot;
                state.is_updating = false;
            });
            warn!("✗ Optimistic update abandoned, snapshot restored");
        }
    }
}

type UpdateFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Local value with server-confirmed optimistic updates.
///
/// # Example
///
/// ```ignore
/// let settings = Optimistic::new(current, move |candidate| {
///     let api = api.clone();
///     async move { api.save_settings(candidate).await.map_err(Error::fetch) }
/// });
///
/// settings.update(json!({"voice": "alloy"})).await?;
/// ```
pub struct Optimistic<T> {
    state: watch::Sender<OptimisticState<T>>,
    update_fn: UpdateFn<T>,
    serial: Mutex<()>,
}

impl<T: Clone + Send + Sync + 'static> Optimistic<T> {
    pub fn new<F, Fut>(initial: T, update_fn: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (state, _) = watch::channel(OptimisticState {
            data: initial,
            is_updating: false,
            error: None,
        });

        let update_fn: UpdateFn<T> =
            Arc::new(move |candidate: T| -> BoxFuture<'static, Result<T>> {
                Box::pin(update_fn(candidate))
            });

        Optimistic {
            state,
            update_fn,
            serial: Mutex::new(()),
        }
    }

    /// Merge `patch` locally, then confirm it with the update function.
    ///
    /// # Errors
    /// Returns the update function's error after rolling back.
    pub async fn update<P>(&self, patch: P) -> Result<T>
    where
        T: Merge<P>,
    {
        self.update_with(move |data| data.merge(patch)).await
    }

    /// Apply `change` locally, then confirm it with the update function.
    ///
    /// # Errors
    /// Returns the update function's error after rolling back.
    pub async fn update_with<C>(&self, change: C) -> Result<T>
    where
        C: FnOnce(&mut T),
    {
        let _serial = self.serial.lock().await;

        let snapshot = self.state.borrow().data.clone();
        let mut candidate = snapshot.clone();
        change(&mut candidate);

        let shown = candidate.clone();
        self.state.send_modify(|state| {
            state.data = shown;
            state.is_updating = true;
            state.error = None;
        });
        let pending = PendingUpdate {
            state: &self.state,
            snapshot: Some(snapshot),
        };

        match (self.update_fn)(candidate).await {
            Ok(confirmed) => {
                pending.confirm(confirmed.clone());
                debug!("✓ Optimistic update confirmed");
                Ok(confirmed)
            }
            Err(e) => {
                pending.roll_back(e.clone());
                warn!("✗ Optimistic update rolled back: {}", e);
                Err(e)
            }
        }
    }

    pub fn data(&self) -> T {
        self.state.borrow().data.clone()
    }

    pub fn is_updating(&self) -> bool {
        self.state.borrow().is_updating
    }

    pub fn error(&self) -> Option<Error> {
        self.state.borrow().error.clone()
    }

    pub fn state(&self) -> OptimisticState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OptimisticState<T>> {
        self.state.subscribe()
    }
}
