//! Module registry: where module scripts and their manifests come from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Module, ModuleFlags, StreamType};

/// Errors raised while reading a module from a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{id}' not found in {location}")]
    NotFound { id: String, location: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid module manifest {path}: {source}\n  Suggestion: check the JSON syntax and field names")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid module id '{id}'")]
    InvalidId { id: String },
}

/// Metadata published alongside a module script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub source_name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub base_url: String,
    /// Search page template with a `%s` placeholder.
    #[serde(default)]
    pub search_base_url: Option<String>,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default, rename = "asyncJS")]
    pub async_js: bool,
    #[serde(default, rename = "streamAsyncJS")]
    pub stream_async_js: bool,
    #[serde(default)]
    pub softsub: bool,
    /// Script path relative to the manifest; defaults to `<id>.js`.
    #[serde(default)]
    pub script_file: Option<String>,
}

impl ModuleManifest {
    #[must_use]
    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags {
            async_js: self.async_js,
            stream_async_js: self.stream_async_js,
            stream_type: self.stream_type,
            softsub: self.softsub,
        }
    }
}

/// Script text plus its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub script: String,
    pub manifest: ModuleManifest,
}

impl ModuleSource {
    /// Builds the immutable [`Module`] handed to the script host.
    #[must_use]
    pub fn into_module(self, id: &str) -> Module {
        let mut module = Module::new(id, self.script, self.manifest.flags())
            .with_base_url(self.manifest.base_url);
        if !self.manifest.source_name.is_empty() {
            module = module.with_name(self.manifest.source_name);
        }
        if let Some(template) = self.manifest.search_base_url {
            module = module.with_search_url(template);
        }
        module
    }
}

/// Supplies modules by id.
pub trait ModuleRegistry: Send + Sync {
    /// Reads the module stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the module is missing or unreadable.
    fn module(&self, id: &str) -> Result<ModuleSource, RegistryError>;
}

/// Registry backed by a directory of `<id>.json` manifests.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of every manifest in the directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory cannot be read.
    pub fn ids(&self) -> Result<Vec<String>, RegistryError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| RegistryError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn read(path: &Path) -> Result<String, RegistryError> {
        std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.')
}

impl ModuleRegistry for DirectoryRegistry {
    fn module(&self, id: &str) -> Result<ModuleSource, RegistryError> {
        if !valid_id(id) {
            return Err(RegistryError::InvalidId { id: id.to_string() });
        }
        let manifest_path = self.root.join(format!("{id}.json"));
        if !manifest_path.is_file() {
            return Err(RegistryError::NotFound {
                id: id.to_string(),
                location: self.root.display().to_string(),
            });
        }
        let manifest: ModuleManifest = serde_json::from_str(&Self::read(&manifest_path)?)
            .map_err(|source| RegistryError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;

        let script_name = manifest
            .script_file
            .clone()
            .unwrap_or_else(|| format!("{id}.js"));
        let script = Self::read(&self.root.join(script_name))?;
        debug!(id, source_name = %manifest.source_name, "module read from registry");
        Ok(ModuleSource { script, manifest })
    }
}
