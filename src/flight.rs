//! Single-flight deduplication of concurrent operations.
//!
//! The first caller for a key becomes the owner: its operation is spawned as
//! a task and shared. Later callers for the same key attach to the shared
//! result instead of starting a second operation. The entry disappears when
//! the owning task finishes, so a later call starts fresh.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use thiserror::Error;
use tracing::debug;

/// The owning task ended without producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("in-flight operation was aborted before completing")]
pub struct FlightAborted;

type SharedFlight<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;

/// Map of in-flight operations keyed by `K`.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    inflight: Arc<DashMap<K, SharedFlight<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> Clone for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the operation built by `make` unless one is already in flight for `key`.
    ///
    /// `make` is only called when this caller becomes the owner. Dropping the
    /// returned future does not cancel the owning task.
    ///
    /// # Errors
    ///
    /// Returns [`FlightAborted`] if the owning task panicked or was aborted.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(key = ?key, "attaching to in-flight operation");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let operation = make();
                let inflight = Arc::clone(&self.inflight);
                let owned_key = key.clone();
                let handle = tokio::spawn(async move {
                    let value = operation.await;
                    inflight.remove(&owned_key);
                    value
                });
                let inflight = Arc::clone(&self.inflight);
                let shared = async move {
                    handle.await.map_err(|_| {
                        inflight.remove(&key);
                        FlightAborted
                    })
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of operations currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Returns true if an operation for `key` is in flight.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }
}
