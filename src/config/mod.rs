//! Configuration types for indexing, downloading and serving.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the per-user directory under the platform config/data dirs.
const APP_DIR: &str = "humble-vault";

/// Returns max(4, available parallelism).
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .max(4)
}

/// Configuration for download operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of concurrent file downloads. `1` runs sequentially.
    pub workers: usize,
    /// Re-check cached files for remote changes instead of skipping them.
    pub update: bool,
    /// Size of each chunk written to disk.
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            update: false,
            chunk_size: 64 * 1024,
        }
    }
}

impl DownloadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent file downloads (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets whether cached files are re-checked for updates.
    #[must_use]
    pub const fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    /// Sets the chunk size used when writing downloads.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Returns true when downloads run one at a time.
    #[must_use]
    pub const fn is_sequential(&self) -> bool {
        self.workers <= 1
    }
}

/// Which files the indexer keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Extensions to keep. Takes precedence over `exclude`.
    pub include: Vec<String>,
    /// Extensions to drop when `include` is empty.
    pub exclude: Vec<String>,
    /// Platforms to keep; empty (or containing `all`) keeps every platform.
    pub platforms: Vec<String>,
    /// Index the trove catalog instead of purchases.
    pub trove: bool,
}

impl FilterConfig {
    /// Lowercases every list and expands the `all` platform wildcard.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let lower = |v: Vec<String>| -> Vec<String> {
            v.into_iter()
                .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        self.include = lower(self.include);
        self.exclude = lower(self.exclude);
        self.platforms = lower(self.platforms);
        if self.platforms.iter().any(|p| p == "all") {
            self.platforms.clear();
        }
        self
    }

    /// Extension filter: include-list, else exclude-list, else everything.
    #[must_use]
    pub fn allows_file(&self, file_name: &str) -> bool {
        let ext = file_name
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if !self.include.is_empty() {
            return self.include.contains(&ext);
        }
        if !self.exclude.is_empty() {
            return !self.exclude.contains(&ext);
        }
        true
    }

    /// Case-insensitive platform allow-list; empty allows all.
    #[must_use]
    pub fn allows_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(platform))
    }
}

/// Path configuration for the library and application state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory where downloaded files are saved.
    pub library_root: PathBuf,
    /// Directory where the database lives.
    pub data_dir: PathBuf,
    /// Directory where `config.toml` is read from.
    pub config_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            library_root: data_dir.join("library"),
            data_dir,
            config_dir,
        }
    }
}

impl PathConfig {
    /// Location of the asset database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("assets.db")
    }

    /// Location of the download skip-cache.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.library_root.join(".cache.json")
    }
}

/// API server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API server bind address.
    pub host: String,
    /// API server port.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Optional OpenWebUI collaborator for category and description suggestions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub url: String,
    /// Models used for classification, tried in order.
    pub classify_models: Vec<String>,
    /// Model used for descriptions.
    pub model: String,
    pub api_key: String,
}

impl AiConfig {
    /// Returns true when a URL and at least one model are set.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && (!self.model.is_empty() || !self.classify_models.is_empty())
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Opaque session credential for the storefront.
    pub session: String,
    pub paths: PathConfig,
    pub filters: FilterConfig,
    pub download: DownloadConfig,
    pub api: ApiConfig,
    pub ai: AiConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then `config.toml`, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let file = defaults.paths.config_dir.join("config.toml");
        let mut config = if file.exists() {
            Self::from_file(&file)?
        } else {
            defaults
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.filters = self.filters.normalized();
        self.download.workers = self.download.workers.max(1);
        self
    }

    /// Applies environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HVAULT_SESSION") {
            self.session = v.trim().to_string();
        }
        if let Some(v) = lookup("HVAULT_LIBRARY") {
            self.paths.library_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("HVAULT_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(workers) = lookup("HVAULT_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
            self.download.workers = workers.max(1);
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.api.port = port;
        }
        if let Some(v) = lookup("OPENWEBUI_URL") {
            self.ai.url = v;
        }
        if let Some(v) = lookup("OPENWEBUI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) =
            lookup("OPENWEBUI_MODELS_CLASSIFY").or_else(|| lookup("OPENWEBUI_MODEL_CLASSIFY"))
        {
            self.ai.classify_models = split_list(&v);
        }
        if let Some(v) = lookup("OPENWEBUI_API_KEY") {
            self.ai.api_key = v;
        }
    }

    /// Overlays values persisted in the store's settings table.
    ///
    /// Lists and booleans are JSON-encoded; everything else is a plain string.
    pub fn apply_settings(&mut self, settings: &HashMap<String, String>) {
        let get = |k: &str| settings.get(k).filter(|v| !v.is_empty());
        let list = |k: &str| get(k).and_then(|v| serde_json::from_str::<Vec<String>>(v).ok());

        if let Some(v) = get("session_cookie") {
            self.session = v.trim().to_string();
        }
        if let Some(v) = get("library_path") {
            self.paths.library_root = PathBuf::from(v);
        }
        if let Some(v) = list("include") {
            self.filters.include = v;
        }
        if let Some(v) = list("exclude") {
            self.filters.exclude = v;
        }
        if let Some(v) = list("platforms") {
            self.filters.platforms = v;
        }
        if let Some(v) = get("trove").and_then(|v| serde_json::from_str::<bool>(v).ok()) {
            self.filters.trove = v;
        }
        if let Some(v) = get("openwebui_url") {
            self.ai.url = v.clone();
        }
        if let Some(v) = get("openwebui_model") {
            self.ai.model = v.clone();
        }
        if let Some(v) = get("openwebui_api_key") {
            self.ai.api_key = v.clone();
        }
        self.filters = std::mem::take(&mut self.filters).normalized();
    }

    /// Renders the settings-table form of this config.
    #[must_use]
    pub fn to_settings(&self) -> HashMap<String, String> {
        let json = |v: &Vec<String>| serde_json::to_string(v).unwrap_or_else(|_| "[]".into());
        HashMap::from([
            ("session_cookie".to_string(), self.session.clone()),
            (
                "library_path".to_string(),
                self.paths.library_root.to_string_lossy().into_owned(),
            ),
            ("include".to_string(), json(&self.filters.include)),
            ("exclude".to_string(), json(&self.filters.exclude)),
            ("platforms".to_string(), json(&self.filters.platforms)),
            ("trove".to_string(), self.filters.trove.to_string()),
            ("openwebui_url".to_string(), self.ai.url.clone()),
            ("openwebui_model".to_string(), self.ai.model.clone()),
            ("openwebui_api_key".to_string(), self.ai.api_key.clone()),
        ])
    }

    /// Returns true when a session and a library root are configured.
    #[must_use]
    pub fn ready(&self) -> bool {
        !self.session.is_empty() && !self.paths.library_root.as_os_str().is_empty()
    }

    /// Models used for classification, falling back to the description model.
    #[must_use]
    pub fn classify_models(&self) -> Vec<String> {
        if self.ai.classify_models.is_empty() {
            split_list(&self.ai.model)
        } else {
            self.ai.classify_models.clone()
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
