//! Cached, single-flight, retrying fetches for auxiliary metadata and artwork.
//!
//! Concurrent requests for the same key share one operation. Successful
//! values are kept until they expire (when a TTL is set) or are invalidated;
//! failures are never cached. Every operation runs under the shared
//! [`retry_with_backoff`] combinator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::download::{DownloadError, classify_error};
use crate::flight::SingleFlight;
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};

/// Errors returned by [`FetchCache::get_or_fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Every attempt failed.
    #[error("fetch of {key} failed after {attempts} attempt(s): {message}")]
    Failed {
        key: String,
        attempts: u32,
        message: String,
    },

    /// The cache was closed while the fetch was pending.
    #[error("fetch of {key} was cancelled")]
    Cancelled { key: String },

    /// The fetch task ended without a value.
    #[error("fetch of {key} was aborted")]
    Aborted { key: String },
}

impl FetchError {
    fn from_retry(key: &str, error: RetryError<DownloadError>) -> Self {
        match error {
            RetryError::Cancelled => Self::Cancelled {
                key: key.to_string(),
            },
            other => {
                let attempts = other.attempts();
                let message = other
                    .into_source()
                    .map_or_else(String::new, |e| e.to_string());
                Self::Failed {
                    key: key.to_string(),
                    attempts,
                    message,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Keyed cache in front of a fallible fetch.
pub struct FetchCache<V>
where
    V: Clone,
{
    entries: Arc<DashMap<String, CacheEntry<V>>>,
    flights: SingleFlight<String, Result<V, FetchError>>,
    policy: RetryPolicy,
    ttl: Option<Duration>,
    cancel: CancellationToken,
}

impl<V> Clone for FetchCache<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            flights: self.flights.clone(),
            policy: self.policy.clone(),
            ttl: self.ttl,
            cancel: self.cancel.clone(),
        }
    }
}

impl<V> std::fmt::Debug for FetchCache<V>
where
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<V> FetchCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose fetches retry under `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            flights: SingleFlight::new(),
            policy,
            ttl: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Expires cached values after `ttl`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Returns the cached value for `key`, or runs `fetch` to produce it.
    ///
    /// `fetch` receives the 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the fetch fails, is cancelled by
    /// [`close`](Self::close), or its task aborts.
    #[instrument(skip(self, fetch), fields(key = %key))]
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V, FetchError>
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, DownloadError>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            debug!("cache hit");
            return Ok(value);
        }

        let entries = Arc::clone(&self.entries);
        let policy = self.policy.clone();
        let cancel = self.cancel.clone();
        let owned_key = key.to_string();

        self.flights
            .run(key.to_string(), move || async move {
                match retry_with_backoff(&owned_key, &policy, &cancel, classify_error, fetch).await
                {
                    Ok(value) => {
                        entries.insert(
                            owned_key,
                            CacheEntry {
                                value: value.clone(),
                                stored_at: Instant::now(),
                            },
                        );
                        Ok(value)
                    }
                    Err(error) => Err(FetchError::from_retry(&owned_key, error)),
                }
            })
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Aborted {
                    key: key.to_string(),
                })
            })
    }

    /// Returns a fresh cached value without fetching.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if let Some(ttl) = self.ttl
            && entry.stored_at.elapsed() >= ttl
        {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Drops the cached value for `key`.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of cached values, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancels pending fetches and their backoff timers.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_fetch(
        calls: &Arc<AtomicU32>,
        value: &'static str,
    ) -> impl FnMut(u32) -> std::pin::Pin<Box<dyn Future<Output = Result<String, DownloadError>> + Send>>
    + Send
    + 'static {
        let calls = Arc::clone(calls);
        move |_| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(value.to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let cache: FetchCache<String> = FetchCache::new(RetryPolicy::no_retry());
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache
            .get_or_fetch("poster:frieren", counting_fetch(&calls, "png"))
            .await
            .unwrap();
        let second = cache
            .get_or_fetch("poster:frieren", counting_fetch(&calls, "other"))
            .await
            .unwrap();

        assert_eq!(first, "png");
        assert_eq!(second, "png");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let cache: FetchCache<String> = FetchCache::new(RetryPolicy::no_retry());
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_fetch("k", counting_fetch(&calls, "v")),
            cache.get_or_fetch("k", counting_fetch(&calls, "v")),
        );
        assert_eq!(a.unwrap(), "v");
        assert_eq!(b.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: FetchCache<String> = FetchCache::new(RetryPolicy::no_retry());

        let err = cache
            .get_or_fetch("k", |_| async {
                Err(DownloadError::http_status("https://img.example/p.png", 404))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Failed { attempts: 1, .. }));
        assert!(cache.is_empty());

        let value = cache
            .get_or_fetch("k", |_| async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let cache: FetchCache<u32> =
            FetchCache::new(RetryPolicy::new(2, Duration::from_millis(100)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let value = cache
            .get_or_fetch("k", move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(DownloadError::http_status("https://img.example/p.png", 503))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache: FetchCache<u32> =
            FetchCache::new(RetryPolicy::no_retry()).with_ttl(Duration::from_secs(60));
        cache.get_or_fetch("k", |_| async { Ok(1) }).await.unwrap();
        assert_eq!(cache.get("k"), Some(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k"), None);
        let refreshed = cache.get_or_fetch("k", |_| async { Ok(2) }).await.unwrap();
        assert_eq!(refreshed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_backoff() {
        let cache: FetchCache<u32> =
            FetchCache::new(RetryPolicy::new(5, Duration::from_secs(30)));
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("k", |_| async {
                        Err(DownloadError::timeout("https://img.example/p.png"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.close();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            FetchError::Cancelled {
                key: "k".to_string()
            }
        );
    }
}
