//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use streamfetch_core::preferences::{
    MAX_CONCURRENT_DOWNLOADS_LIMIT, Preferences, QualityPreference,
};

/// File configuration for streamfetch defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Directory that receives downloaded media.
    pub download_dir: Option<PathBuf>,
    /// Download record file.
    pub records_path: Option<PathBuf>,
    /// Directory holding module manifests and scripts.
    pub modules_dir: Option<PathBuf>,
    pub quality: Option<QualityPreference>,
    pub max_concurrent_downloads: Option<usize>,
    pub max_retry_attempts: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub resolution_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Seconds a failed row stays visible before it is dismissed.
    pub failure_grace_secs: Option<u64>,
}

impl FileConfig {
    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.max_concurrent_downloads
            && !(1..=MAX_CONCURRENT_DOWNLOADS_LIMIT).contains(&limit)
        {
            bail!(
                "Invalid config value for `max_concurrent_downloads`: {limit}. Expected range: 1..={MAX_CONCURRENT_DOWNLOADS_LIMIT}"
            );
        }
        if let Some(retries) = self.max_retry_attempts
            && retries > 10
        {
            bail!("Invalid config value for `max_retry_attempts`: {retries}. Expected range: 0..=10");
        }
        if let Some(delay) = self.initial_retry_delay_ms
            && delay > 60_000
        {
            bail!(
                "Invalid config value for `initial_retry_delay_ms`: {delay}. Expected range: 0..=60000"
            );
        }
        validate_range("resolution_timeout_secs", self.resolution_timeout_secs, 1, 300)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1, 3600)?;
        validate_range("failure_grace_secs", self.failure_grace_secs, 0, 3600)?;
        Ok(())
    }

    /// Overlays the values present in the file onto `preferences`.
    pub fn apply_to(&self, preferences: &mut Preferences) {
        if let Some(dir) = &self.download_dir {
            preferences.download_dir.clone_from(dir);
            if self.records_path.is_none() {
                preferences.records_path = dir.join("records.json");
            }
        }
        if let Some(path) = &self.records_path {
            preferences.records_path.clone_from(path);
        }
        if let Some(quality) = self.quality {
            preferences.quality_preference = quality;
        }
        if let Some(limit) = self.max_concurrent_downloads {
            preferences.max_concurrent_downloads = limit;
        }
        if let Some(retries) = self.max_retry_attempts {
            preferences.max_retry_attempts = retries;
        }
        if let Some(ms) = self.initial_retry_delay_ms {
            preferences.initial_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.resolution_timeout_secs {
            preferences.resolution_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            preferences.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            preferences.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.failure_grace_secs {
            preferences.failure_grace_delay = Duration::from_secs(secs);
        }
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/streamfetch/config.toml`
/// 2. `$HOME/.config/streamfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("streamfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("streamfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "download_dir" => {
                cfg.download_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "records_path" => {
                cfg.records_path = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "modules_dir" => {
                cfg.modules_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "quality" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                let quality = parsed
                    .parse::<QualityPreference>()
                    .map_err(|e| anyhow::anyhow!(e))
                    .with_context(invalid)?;
                cfg.quality = Some(quality);
            }
            "max_concurrent_downloads" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let n = usize::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_concurrent_downloads out of range"))?;
                cfg.max_concurrent_downloads = Some(n);
            }
            "max_retry_attempts" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_retry_attempts out of range for u32"))?;
                cfg.max_retry_attempts = Some(n);
            }
            "initial_retry_delay_ms" => {
                cfg.initial_retry_delay_ms = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "resolution_timeout_secs" => {
                cfg.resolution_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "failure_grace_secs" => {
                cfg.failure_grace_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}
