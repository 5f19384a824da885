//! Fixed-priority stream resolution loop.
//!
//! For each request the resolver walks [`ResolutionMethod::ORDER`], skipping
//! methods whose precondition flag the module does not declare:
//!
//! 0. `AsyncFuture`: `extractStreamUrl(episodeRef)`, which fetches on its own (`asyncJS`)
//! 1. `AsyncDocument`: fetch the episode page, then `extractStreamUrl(html)` (`streamAsyncJS`)
//! 2. `SyncDocument`: fetch the episode page, then `extractStreamUrl(html)` (always)
//!
//! The first method whose payload classifies into at least one variant wins.
//! Failures and empty payloads advance to the next method; when none is left
//! the request fails with [`ResolveError::Exhausted`].

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::classify::classify_payload;
use super::error::{ClassificationError, ResolveError};
use super::{ResolutionRequest, StreamResolutionResult};
use crate::download::{HttpClient, RequestHeaders, classify_error};
use crate::flight::SingleFlight;
use crate::logging::{SharedLogSink, Severity};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::script::{EntryPoint, ModuleFlags, ModuleSession, ScriptError};

/// Default retries for episode page fetches.
const DOCUMENT_FETCH_RETRIES: u32 = 1;

/// One way of calling `extractStreamUrl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMethod {
    AsyncFuture,
    AsyncDocument,
    SyncDocument,
}

impl ResolutionMethod {
    /// Priority order; never reordered.
    pub const ORDER: [Self; 3] = [Self::AsyncFuture, Self::AsyncDocument, Self::SyncDocument];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::AsyncFuture => 0,
            Self::AsyncDocument => 1,
            Self::SyncDocument => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AsyncFuture => "async_future",
            Self::AsyncDocument => "async_document",
            Self::SyncDocument => "sync_document",
        }
    }

    /// Whether the module's flags allow this method.
    #[must_use]
    pub fn applies(self, flags: &ModuleFlags) -> bool {
        match self {
            Self::AsyncFuture => flags.async_js,
            Self::AsyncDocument => flags.stream_async_js,
            Self::SyncDocument => true,
        }
    }

    fn needs_document(self) -> bool {
        !matches!(self, Self::AsyncFuture)
    }
}

#[derive(Debug, Error)]
enum MethodFailure {
    #[error("{0}")]
    Script(ScriptError),
    #[error("{0}")]
    Classification(ClassificationError),
    #[error("episode page fetch failed: {0}")]
    Document(String),
    #[error("payload contained no streams")]
    NoStreams,
}

/// Resolves episode references into stream descriptors.
#[derive(Debug, Clone)]
pub struct StreamResolver {
    http: HttpClient,
    sink: SharedLogSink,
    document_retry: RetryPolicy,
    flights: SingleFlight<String, Result<StreamResolutionResult, ResolveError>>,
    cancel: CancellationToken,
}

impl StreamResolver {
    #[must_use]
    pub fn new(http: HttpClient, sink: SharedLogSink) -> Self {
        Self {
            http,
            sink,
            document_retry: RetryPolicy::new(
                DOCUMENT_FETCH_RETRIES,
                crate::retry::DEFAULT_INITIAL_DELAY,
            ),
            flights: SingleFlight::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Retry policy for episode page fetches.
    #[must_use]
    pub fn with_document_retry(mut self, policy: RetryPolicy) -> Self {
        self.document_retry = policy;
        self
    }

    /// Number of resolutions currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Cancels pending page-fetch retries of running resolutions.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolves `episode_ref` with the module in `session`.
    ///
    /// Concurrent calls with the same module load, reference, and soft-sub
    /// flag share one resolution. Subtitle tracks are returned only when
    /// `softsub` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Exhausted`] when no method produced a stream,
    /// [`ResolveError::Unsupported`] when the module has no
    /// `extractStreamUrl`, and [`ResolveError::Discarded`] when the module
    /// was replaced mid-request.
    #[instrument(skip(self, session), fields(module = %session.module().id, fingerprint))]
    pub async fn resolve(
        &self,
        session: &ModuleSession,
        episode_ref: &str,
        softsub: bool,
    ) -> Result<StreamResolutionResult, ResolveError> {
        let request = ResolutionRequest::new(
            &session.module().id,
            session.generation(),
            episode_ref,
            softsub,
        );
        let fingerprint = request.fingerprint();
        tracing::Span::current().record("fingerprint", fingerprint.as_str());

        let this = self.clone();
        let session = session.clone();
        self.flights
            .run(fingerprint, move || async move {
                this.run_methods(&session, &request).await
            })
            .await
            .unwrap_or_else(|_| Err(ResolveError::aborted(episode_ref)))
    }

    async fn run_methods(
        &self,
        session: &ModuleSession,
        request: &ResolutionRequest,
    ) -> Result<StreamResolutionResult, ResolveError> {
        let module = session.module();
        let Some(entry) = session.capabilities().extract_stream_url.clone() else {
            self.sink.log(
                &format!("Module '{}' does not support stream extraction", module.name),
                Severity::Error,
            );
            return Err(ResolveError::unsupported(&module.id));
        };

        let mut tried_count = 0usize;
        let mut last_failure: Option<String> = None;

        for method in ResolutionMethod::ORDER {
            if !method.applies(&module.flags) {
                debug!(method = method.as_str(), "method not declared by module, skipping");
                continue;
            }
            tried_count += 1;
            debug!(
                method = method.as_str(),
                method_index = method.index(),
                "invoking"
            );

            match self
                .try_method(session, &entry, method, &request.episode_ref)
                .await
            {
                Ok(mut result) => {
                    if !request.softsub {
                        result.subtitles.clear();
                    }
                    info!(
                        method = method.as_str(),
                        variants = result.variants.len(),
                        subtitles = result.subtitles.len(),
                        "stream resolved"
                    );
                    return Ok(result);
                }
                Err(MethodFailure::Script(ScriptError::Discarded { generation })) => {
                    return Err(ResolveError::Discarded { generation });
                }
                Err(failure) => {
                    debug!(method = method.as_str(), error = %failure, "method failed, trying next");
                    last_failure = Some(failure.to_string());
                }
            }
        }

        warn!(
            episode = %request.episode_ref,
            tried_count,
            "no method produced a stream"
        );
        self.sink.log(
            &format!("Stream not found for {}", request.episode_ref),
            Severity::Error,
        );
        Err(ResolveError::exhausted(
            &module.id,
            &request.episode_ref,
            tried_count,
            last_failure,
        ))
    }

    async fn try_method(
        &self,
        session: &ModuleSession,
        entry: &Arc<dyn EntryPoint>,
        method: ResolutionMethod,
        episode_ref: &str,
    ) -> Result<StreamResolutionResult, MethodFailure> {
        let argument = if method.needs_document() {
            self.fetch_document(session, episode_ref).await?
        } else {
            episode_ref.to_string()
        };

        let payload = session
            .call(entry.as_ref(), vec![Value::String(argument)])
            .await
            .map_err(MethodFailure::Script)?;

        let result = classify_payload(&payload).map_err(MethodFailure::Classification)?;
        if result.is_empty() {
            return Err(MethodFailure::NoStreams);
        }
        Ok(result)
    }

    async fn fetch_document(
        &self,
        session: &ModuleSession,
        url: &str,
    ) -> Result<String, MethodFailure> {
        let mut headers = RequestHeaders::new();
        let base_url = &session.module().base_url;
        if !base_url.is_empty() {
            headers.insert("Referer".to_string(), base_url.clone());
        }

        retry_with_backoff(
            url,
            &self.document_retry,
            &self.cancel,
            classify_error,
            |_| self.http.fetch_text(url, &headers),
        )
        .await
        .map_err(|e| MethodFailure::Document(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_method_order_is_fixed() {
        let indices: Vec<usize> = ResolutionMethod::ORDER.iter().map(|m| m.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_method_preconditions() {
        let sync_only = ModuleFlags::default();
        assert!(!ResolutionMethod::AsyncFuture.applies(&sync_only));
        assert!(!ResolutionMethod::AsyncDocument.applies(&sync_only));
        assert!(ResolutionMethod::SyncDocument.applies(&sync_only));

        let async_module = ModuleFlags {
            async_js: true,
            ..ModuleFlags::default()
        };
        assert!(ResolutionMethod::AsyncFuture.applies(&async_module));
    }
}
