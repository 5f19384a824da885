//! The script host and its module sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::completion::invoke;
use super::{
    Capabilities, EntryPoint, Environment, HostServices, Module, ScriptEngine, ScriptError,
    entrypoints,
};
use crate::catalog::{
    EpisodeLink, MediaDetails, SearchItem, parse_details, parse_episodes, parse_search_results,
};
use crate::download::{DownloadError, HttpClient, RequestHeaders};
use crate::logging::SharedLogSink;
use crate::preferences::DEFAULT_RESOLUTION_TIMEOUT;
use crate::resolver::ClassificationError;

/// Errors from the catalogue entrypoints.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The module does not define the entrypoint.
    #[error("module '{module}' does not define {entrypoint}")]
    Unsupported { module: String, entrypoint: String },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    /// The page handed to a document-parsing entrypoint could not be fetched.
    #[error(transparent)]
    Fetch(#[from] DownloadError),
}

/// Holds the single active module.
pub struct ScriptHost {
    engine: Arc<dyn ScriptEngine>,
    services: HostServices,
    call_timeout: Duration,
    generation: Arc<AtomicU64>,
    current: RwLock<Option<ModuleSession>>,
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ScriptHost {
    #[must_use]
    pub fn new(engine: Arc<dyn ScriptEngine>, http: HttpClient, sink: SharedLogSink) -> Self {
        Self {
            engine,
            services: HostServices { http, sink },
            call_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            generation: Arc::new(AtomicU64::new(0)),
            current: RwLock::new(None),
        }
    }

    /// Bounds how long a deferred entrypoint result may take.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Evaluates `module` and makes it the active module.
    ///
    /// On success the previous session is discarded: calls made through it
    /// from now on fail with [`ScriptError::Discarded`]. A failed load leaves
    /// the previous session active.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Invalid`] if the script fails to evaluate.
    #[instrument(skip(self, module), fields(module = %module.id))]
    pub fn load(&self, module: Module) -> Result<ModuleSession, ScriptError> {
        let environment = self.engine.load(&module, self.services.clone())?;
        let capabilities = Capabilities::resolve(environment.as_ref());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            generation,
            capabilities = ?capabilities.available(),
            "module loaded"
        );

        let session = ModuleSession {
            inner: Arc::new(SessionInner {
                module,
                environment,
                capabilities,
                generation,
                live_generation: Arc::clone(&self.generation),
                services: self.services.clone(),
                call_timeout: self.call_timeout,
            }),
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(session)
    }

    /// The active session, if a module is loaded.
    #[must_use]
    pub fn current(&self) -> Option<ModuleSession> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discards the active session without loading another.
    pub fn unload(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct SessionInner {
    module: Module,
    environment: Arc<dyn Environment>,
    capabilities: Capabilities,
    generation: u64,
    live_generation: Arc<AtomicU64>,
    services: HostServices,
    call_timeout: Duration,
}

/// Handle to one loaded module. Cheap to clone.
#[derive(Clone)]
pub struct ModuleSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ModuleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSession")
            .field("module", &self.inner.module.id)
            .field("generation", &self.inner.generation)
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}

impl ModuleSession {
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.inner.module
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Returns false once another module has been loaded.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.inner.live_generation.load(Ordering::SeqCst) == self.inner.generation
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Looks up any function defined by the module.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn EntryPoint>> {
        self.inner.environment.lookup(name)
    }

    fn ensure_current(&self) -> Result<(), ScriptError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ScriptError::discarded(self.inner.generation))
        }
    }

    /// Calls `entry` and waits for its single completion.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Discarded`] if the session was replaced before
    /// or during the call, otherwise whatever the call produced.
    pub async fn call(&self, entry: &dyn EntryPoint, args: Vec<Value>) -> Result<Value, ScriptError> {
        self.ensure_current()?;
        let result = invoke(entry, args, self.inner.call_timeout).await;
        self.ensure_current()?;
        result
    }

    /// Calls the function named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::NotFound`] if the module does not define it.
    pub async fn call_named(&self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let entry = self.lookup(name).ok_or_else(|| ScriptError::not_found(name))?;
        self.call(entry.as_ref(), args).await
    }

    /// Searches the module's catalogue.
    ///
    /// Async modules receive the query; other modules receive the page at
    /// the module's search URL, when one is configured.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    #[instrument(skip(self), fields(module = %self.inner.module.id))]
    pub async fn search(&self, query: &str) -> Result<Vec<SearchItem>, CatalogError> {
        let entry = self.require(
            self.inner.capabilities.search_results.as_ref(),
            entrypoints::SEARCH_RESULTS,
        )?;
        let argument = match (&self.inner.module.search_url, self.inner.module.flags.async_js) {
            (Some(template), false) => {
                let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
                self.fetch_page(&template.replace("%s", &encoded)).await?
            }
            _ => query.to_string(),
        };
        let payload = self.call(entry.as_ref(), vec![Value::String(argument)]).await?;
        let items = parse_search_results(&payload)?;
        debug!(count = items.len(), "search results parsed");
        Ok(items)
    }

    /// Fetches details for the title at `url`.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    #[instrument(skip(self), fields(module = %self.inner.module.id))]
    pub async fn details(&self, url: &str) -> Result<Vec<MediaDetails>, CatalogError> {
        let entry = self.require(
            self.inner.capabilities.extract_details.as_ref(),
            entrypoints::EXTRACT_DETAILS,
        )?;
        let payload = self.call_with_page(entry.as_ref(), url).await?;
        Ok(parse_details(&payload)?)
    }

    /// Lists the episodes of the title at `url`.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    #[instrument(skip(self), fields(module = %self.inner.module.id))]
    pub async fn episodes(&self, url: &str) -> Result<Vec<EpisodeLink>, CatalogError> {
        let entry = self.require(
            self.inner.capabilities.extract_episodes.as_ref(),
            entrypoints::EXTRACT_EPISODES,
        )?;
        let payload = self.call_with_page(entry.as_ref(), url).await?;
        Ok(parse_episodes(&payload)?)
    }

    fn require(
        &self,
        entry: Option<&Arc<dyn EntryPoint>>,
        name: &str,
    ) -> Result<Arc<dyn EntryPoint>, CatalogError> {
        entry.cloned().ok_or_else(|| CatalogError::Unsupported {
            module: self.inner.module.id.clone(),
            entrypoint: name.to_string(),
        })
    }

    /// Async modules receive `url`; others receive the fetched page.
    async fn call_with_page(&self, entry: &dyn EntryPoint, url: &str) -> Result<Value, CatalogError> {
        let argument = if self.inner.module.flags.async_js {
            url.to_string()
        } else {
            self.fetch_page(url).await?
        };
        Ok(self.call(entry, vec![Value::String(argument)]).await?)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, DownloadError> {
        let mut headers = RequestHeaders::new();
        if !self.inner.module.base_url.is_empty() {
            headers.insert("Referer".to_string(), self.inner.module.base_url.clone());
        }
        self.inner.services.http.fetch_text(url, &headers).await
    }
}
