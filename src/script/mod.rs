//! Module script hosting.
//!
//! A [`Module`] is third-party script text plus the capability flags it
//! declares. A [`ScriptEngine`] evaluates the text into an [`Environment`],
//! from which named [`EntryPoint`]s are looked up. The [`ScriptHost`] keeps
//! exactly one module active; loading another returns a fresh
//! [`ModuleSession`] and discards the previous one.
//!
//! Entrypoints either return a value directly or return a [`Thenable`] that
//! settles later. [`invoke`] and [`invoke_with_callback`] turn both shapes
//! into one completion delivered exactly once.

mod completion;
mod error;
mod host;
mod native;
#[cfg(feature = "quickjs")]
mod quickjs;
mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use completion::{CompletionCallback, invoke, invoke_with_callback};
pub use error::ScriptError;
pub use host::{CatalogError, ModuleSession, ScriptHost};
pub use native::{Deferred, NativeEngine, NativeFn, NativeModule};
#[cfg(feature = "quickjs")]
pub use quickjs::QuickJsEngine;
pub use registry::{
    DirectoryRegistry, ModuleManifest, ModuleRegistry, ModuleSource, RegistryError,
};

use crate::download::HttpClient;
use crate::logging::SharedLogSink;

/// Entrypoint names the host looks up.
pub mod entrypoints {
    pub const SEARCH_RESULTS: &str = "searchResults";
    pub const EXTRACT_DETAILS: &str = "extractDetails";
    pub const EXTRACT_EPISODES: &str = "extractEpisodes";
    pub const EXTRACT_STREAM_URL: &str = "extractStreamUrl";
}

/// Stream type a module declares for the URLs it produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum StreamType {
    #[default]
    Hls,
    Mp4,
    Direct,
}

impl StreamType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Mp4 => "mp4",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hls" | "m3u8" => Ok(Self::Hls),
            "mp4" => Ok(Self::Mp4),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown stream type: {other}")),
        }
    }
}

impl TryFrom<String> for StreamType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Capability flags declared alongside a module's script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    /// `extractStreamUrl` is an async function that fetches on its own.
    pub async_js: bool,
    /// `extractStreamUrl` is async and expects the fetched episode document.
    pub stream_async_js: bool,
    pub stream_type: StreamType,
    /// The module can return soft subtitles.
    pub softsub: bool,
}

/// A loaded module. Immutable; reloading replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub script: String,
    pub flags: ModuleFlags,
    /// Search page template for non-async modules; `%s` is replaced by the
    /// form-encoded query.
    pub search_url: Option<String>,
}

impl Module {
    #[must_use]
    pub fn new(id: impl Into<String>, script: impl Into<String>, flags: ModuleFlags) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: String::new(),
            script: script.into(),
            flags,
            search_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_search_url(mut self, template: impl Into<String>) -> Self {
        self.search_url = Some(template.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Host services an engine exposes to scripts.
#[derive(Debug, Clone)]
pub struct HostServices {
    pub http: HttpClient,
    pub sink: SharedLogSink,
}

/// Success continuation attached to a [`Thenable`]. May be called more than once.
pub type OnFulfilled = Box<dyn Fn(Value) + Send + Sync>;

/// Failure continuation attached to a [`Thenable`]. May be called more than once.
pub type OnRejected = Box<dyn Fn(String) + Send + Sync>;

/// A value that settles later and accepts completion continuations.
pub trait Thenable: Send {
    /// Attaches continuations; the thenable calls them when it settles.
    fn then(self: Box<Self>, on_fulfilled: OnFulfilled, on_rejected: OnRejected);
}

/// What an entrypoint call returned.
pub enum ScriptValue {
    Immediate(Value),
    Deferred(Box<dyn Thenable>),
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(value) => f.debug_tuple("Immediate").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        Self::Immediate(value)
    }
}

/// A callable function defined by a module.
pub trait EntryPoint: Send + Sync {
    fn name(&self) -> &str;

    /// Calls the function.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Exception`] if the call throws synchronously.
    fn call(&self, args: Vec<Value>) -> Result<ScriptValue, ScriptError>;
}

/// An evaluated module script.
pub trait Environment: Send + Sync {
    /// Looks up a function by name; `None` means the capability is unavailable.
    fn lookup(&self, name: &str) -> Option<Arc<dyn EntryPoint>>;
}

/// Evaluates module scripts.
pub trait ScriptEngine: Send + Sync {
    /// Evaluates `module.script` into a fresh environment.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Invalid`] if evaluation raises.
    fn load(&self, module: &Module, host: HostServices) -> Result<Arc<dyn Environment>, ScriptError>;
}

/// Entrypoints resolved once when a module loads.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub search_results: Option<Arc<dyn EntryPoint>>,
    pub extract_details: Option<Arc<dyn EntryPoint>>,
    pub extract_episodes: Option<Arc<dyn EntryPoint>>,
    pub extract_stream_url: Option<Arc<dyn EntryPoint>>,
}

impl Capabilities {
    #[must_use]
    pub fn resolve(environment: &dyn Environment) -> Self {
        Self {
            search_results: environment.lookup(entrypoints::SEARCH_RESULTS),
            extract_details: environment.lookup(entrypoints::EXTRACT_DETAILS),
            extract_episodes: environment.lookup(entrypoints::EXTRACT_EPISODES),
            extract_stream_url: environment.lookup(entrypoints::EXTRACT_STREAM_URL),
        }
    }

    /// Names of the entrypoints the module defines.
    #[must_use]
    pub fn available(&self) -> Vec<&'static str> {
        [
            (entrypoints::SEARCH_RESULTS, self.search_results.is_some()),
            (entrypoints::EXTRACT_DETAILS, self.extract_details.is_some()),
            (entrypoints::EXTRACT_EPISODES, self.extract_episodes.is_some()),
            (entrypoints::EXTRACT_STREAM_URL, self.extract_stream_url.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("available", &self.available())
            .finish()
    }
}
