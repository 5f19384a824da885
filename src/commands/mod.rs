//! CLI command handlers.

mod download;
mod records;
mod resolve;
mod search;
mod variants;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use streamfetch_core::download::{HttpClient, RequestHeaders};
use streamfetch_core::logging::default_sink;
use streamfetch_core::preferences::Preferences;
use streamfetch_core::resolver::StreamResolver;
use streamfetch_core::retry::RetryPolicy;
use streamfetch_core::script::{
    DirectoryRegistry, ModuleRegistry, ModuleSession, ScriptEngine, ScriptHost,
};
use tracing::debug;

use crate::app_config::FileConfig;
use crate::cli::Cli;

pub use download::run_download_command;
pub use records::run_records_command;
pub use resolve::run_resolve_command;
pub use search::run_search_command;
pub use variants::run_variants_command;

const DEFAULT_MODULES_DIR: &str = "modules";

/// Settings shared by every command after config and global flags merge.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub preferences: Preferences,
    pub modules_dir: PathBuf,
    pub quiet: bool,
}

impl AppContext {
    #[must_use]
    pub fn new(cli: &Cli, file: Option<&FileConfig>) -> Self {
        let mut preferences = Preferences::default();
        if let Some(file) = file {
            file.apply_to(&mut preferences);
        }
        let modules_dir = cli
            .modules
            .clone()
            .or_else(|| file.and_then(|f| f.modules_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULES_DIR));
        Self {
            preferences,
            modules_dir,
            quiet: cli.quiet,
        }
    }

    pub(crate) fn http(&self) -> Result<HttpClient> {
        HttpClient::with_timeouts(
            self.preferences.connect_timeout,
            self.preferences.read_timeout,
        )
        .context("Failed to build HTTP client")
    }

    /// Reads module `id` from the modules directory and evaluates it.
    pub(crate) fn load_module(&self, id: &str, http: &HttpClient) -> Result<ModuleSession> {
        let registry = DirectoryRegistry::new(self.modules_dir.clone());
        let source = registry
            .module(id)
            .with_context(|| format!("Failed to read module '{id}'"))?;
        let host = ScriptHost::new(script_engine()?, http.clone(), default_sink())
            .with_call_timeout(self.preferences.resolution_timeout);
        let session = host
            .load(source.into_module(id))
            .with_context(|| format!("Failed to load module '{id}'"))?;
        debug!(module = id, capabilities = ?session.capabilities().available(), "module ready");
        Ok(session)
    }

    pub(crate) fn resolver(&self, http: &HttpClient) -> StreamResolver {
        StreamResolver::new(http.clone(), default_sink()).with_document_retry(RetryPolicy::new(
            self.preferences.max_retry_attempts,
            self.preferences.initial_retry_delay,
        ))
    }
}

#[cfg(feature = "quickjs")]
#[allow(clippy::unnecessary_wraps)]
fn script_engine() -> Result<Arc<dyn ScriptEngine>> {
    Ok(Arc::new(streamfetch_core::script::QuickJsEngine::new()))
}

#[cfg(not(feature = "quickjs"))]
fn script_engine() -> Result<Arc<dyn ScriptEngine>> {
    anyhow::bail!(
        "This build cannot evaluate module scripts\n  Suggestion: rebuild with `--features quickjs`"
    )
}

pub(crate) fn header_map(headers: &[(String, String)]) -> RequestHeaders {
    headers.iter().cloned().collect()
}
