
use anyhow::{Context, Result};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const APP_DIR_NAME: &str = ".medctx";
pub const HOME_ENV: &str = "MEDCTX_HOME";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 3072;
pub const MAX_UPLOAD_BATCH_SIZE: usize = 1000;

/// Which backend pair serves records and vectors for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    #[serde(alias = "azure")]
    Managed,
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "managed" | "azure" => Ok(Self::Managed),
            other => Err(ConfigError::InvalidStorageMode(other.to_string())),
        }
    }
}

impl fmt::Display for StorageMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Managed => f.write_str("managed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub cosmos: CosmosConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory for JSON snapshots and index files. Relative paths resolve
    /// against the application directory.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CosmosConfig {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub database: String,
    pub documents_container: String,
    pub chunks_container: String,
}

impl Default for CosmosConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: None,
            database: "medical-context-db".to_string(),
            documents_container: "documents".to_string(),
            chunks_container: "chunks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub index_name: String,
    pub api_version: String,
    pub upload_batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: None,
            index_name: "medical-context-index".to_string(),
            api_version: "2024-07-01".to_string(),
            upload_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Azure OpenAI deployment name of the embedding model.
    pub deployment: Option<String>,
    pub api_version: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub batch_delay_seconds: f64,
    pub retry_attempts: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            deployment: None,
            api_version: "2024-08-01-preview".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            batch_size: 5,
            batch_delay_seconds: 2.0,
            retry_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),
    #[error("Invalid storage mode: {0} (must be 'local' or 'managed')")]
    InvalidStorageMode(String),
    #[error("Invalid URL for {0}: {1}")]
    InvalidUrl(&'static str, String),
    #[error("Invalid number for {0}: {1}")]
    InvalidNumber(&'static str, String),
    #[error("Invalid embedding batch size: {0} (must be between 1 and 2048)")]
    InvalidBatchSize(usize),
    #[error("Invalid upload batch size: {0} (must be between 1 and 1000)")]
    InvalidUploadBatchSize(usize),
    #[error("Invalid embedding dimension: {0} (must be between 1 and 4096)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid batch delay: {0} (must be a finite, non-negative number of seconds)")]
    InvalidBatchDelay(f64),
    #[error("Invalid HTTP timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid key for {0}: not valid base64")]
    InvalidKey(&'static str),
    #[error("Invalid name for {0}: cannot be empty")]
    EmptyName(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Resolved Cosmos DB settings; only obtainable when every required value is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmosCredentials {
    pub endpoint: Url,
    pub key: String,
    pub database: String,
    pub documents_container: String,
    pub chunks_container: String,
}

/// Resolved Azure AI Search settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCredentials {
    pub endpoint: Url,
    pub key: String,
    pub index_name: String,
    pub api_version: String,
}

/// Resolved Azure OpenAI embedding settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingCredentials {
    pub endpoint: Url,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
}

/// Everything managed mode needs before the first network call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCredentials {
    pub cosmos: CosmosCredentials,
    pub search: SearchCredentials,
}

impl Config {
    /// Application directory: `$MEDCTX_HOME` if set, else `~/.medctx`.
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        dirs::home_dir()
            .map(|home| home.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load `config.toml` from `config_dir` and apply process environment overrides.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        Self::load_with_env(config_dir, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::load`] with an explicit environment lookup.
    #[inline]
    pub fn load_with_env<P, F>(config_dir: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = config_dir.as_ref().join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            toml::from_str::<Config>(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            debug!("No config file at {}, using defaults", config_path.display());
            Config::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .apply_env(lookup)
            .context("Invalid environment setting")?;
        config.normalize();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Overlay the flat named settings. Unset or blank variables leave the
    /// file value in place.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().trim_matches('"').to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(mode) = get("STORAGE_MODE") {
            self.storage_mode = mode.parse()?;
        }
        if let Some(dir) = get("MEDCTX_CACHE_DIR") {
            self.local.cache_dir = Some(PathBuf::from(dir));
        }

        override_opt(&mut self.cosmos.endpoint, get("COSMOS_ENDPOINT"));
        override_opt(&mut self.cosmos.key, get("COSMOS_KEY"));
        override_string(&mut self.cosmos.database, get("COSMOS_DB_NAME"));
        override_string(
            &mut self.cosmos.documents_container,
            get("COSMOS_CONTAINER_DOCUMENTS"),
        );
        override_string(
            &mut self.cosmos.chunks_container,
            get("COSMOS_CONTAINER_CHUNKS"),
        );

        override_opt(&mut self.search.endpoint, get("AZURE_SEARCH_ENDPOINT"));
        override_opt(&mut self.search.key, get("AZURE_SEARCH_KEY"));
        override_string(&mut self.search.index_name, get("AZURE_SEARCH_INDEX_NAME"));

        override_opt(&mut self.embedding.endpoint, get("AZURE_OPENAI_ENDPOINT"));
        override_opt(&mut self.embedding.api_key, get("AZURE_OPENAI_API_KEY"));
        override_opt(&mut self.embedding.deployment, get("AOAI_EMBED_MODEL"));
        override_string(
            &mut self.embedding.api_version,
            get("AZURE_OPENAI_API_VERSION"),
        );
        if let Some(v) = get("EMBED_BATCH_SIZE") {
            self.embedding.batch_size = parse_number("EMBED_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("EMBED_DELAY_SECONDS") {
            self.embedding.batch_delay_seconds = parse_number("EMBED_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = get("EMBED_DIM") {
            self.embedding.dimension = parse_number("EMBED_DIM", &v)?;
        }
        if let Some(v) = get("HTTP_TIMEOUT_SECONDS") {
            self.http.timeout_seconds = parse_number("HTTP_TIMEOUT_SECONDS", &v)?;
        }

        Ok(())
    }

    fn normalize(&mut self) {
        for endpoint in [
            &mut self.cosmos.endpoint,
            &mut self.search.endpoint,
            &mut self.embedding.endpoint,
        ] {
            if let Some(ep) = endpoint.as_mut() {
                *ep = normalize_endpoint(ep);
            }
        }
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Directory holding the local snapshots and index files
    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        match &self.local.cache_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.join("cache"),
        }
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.search.validate()?;
        self.cosmos.validate()?;

        if !(1..=600).contains(&self.http.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.http.timeout_seconds));
        }

        Ok(())
    }

    /// Credentials for both managed services, failing on the first missing setting.
    #[inline]
    pub fn managed_credentials(&self) -> Result<ManagedCredentials, ConfigError> {
        Ok(ManagedCredentials {
            cosmos: self.cosmos.credentials()?,
            search: self.search.credentials()?,
        })
    }
}

impl CosmosConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::EmptyName("COSMOS_DB_NAME"));
        }
        if self.documents_container.trim().is_empty() {
            return Err(ConfigError::EmptyName("COSMOS_CONTAINER_DOCUMENTS"));
        }
        if self.chunks_container.trim().is_empty() {
            return Err(ConfigError::EmptyName("COSMOS_CONTAINER_CHUNKS"));
        }
        if let Some(endpoint) = present(&self.endpoint) {
            parse_endpoint("COSMOS_ENDPOINT", endpoint)?;
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<CosmosCredentials, ConfigError> {
        let endpoint = present(&self.endpoint).ok_or(ConfigError::MissingSetting("COSMOS_ENDPOINT"))?;
        let key = present(&self.key).ok_or(ConfigError::MissingSetting("COSMOS_KEY"))?;
        if BASE64_STANDARD.decode(key).is_err() {
            return Err(ConfigError::InvalidKey("COSMOS_KEY"));
        }
        Ok(CosmosCredentials {
            endpoint: parse_endpoint("COSMOS_ENDPOINT", endpoint)?,
            key: key.to_string(),
            database: self.database.clone(),
            documents_container: self.documents_container.clone(),
            chunks_container: self.chunks_container.clone(),
        })
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_name.trim().is_empty() {
            return Err(ConfigError::EmptyName("AZURE_SEARCH_INDEX_NAME"));
        }
        if !(1..=MAX_UPLOAD_BATCH_SIZE).contains(&self.upload_batch_size) {
            return Err(ConfigError::InvalidUploadBatchSize(self.upload_batch_size));
        }
        if let Some(endpoint) = present(&self.endpoint) {
            parse_endpoint("AZURE_SEARCH_ENDPOINT", endpoint)?;
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<SearchCredentials, ConfigError> {
        let endpoint =
            present(&self.endpoint).ok_or(ConfigError::MissingSetting("AZURE_SEARCH_ENDPOINT"))?;
        let key = present(&self.key).ok_or(ConfigError::MissingSetting("AZURE_SEARCH_KEY"))?;
        Ok(SearchCredentials {
            endpoint: parse_endpoint("AZURE_SEARCH_ENDPOINT", endpoint)?,
            key: key.to_string(),
            index_name: self.index_name.clone(),
            api_version: self.api_version.clone(),
        })
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2048).contains(&self.batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        if !(1..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }
        if !self.batch_delay_seconds.is_finite() || self.batch_delay_seconds < 0.0 {
            return Err(ConfigError::InvalidBatchDelay(self.batch_delay_seconds));
        }
        if let Some(endpoint) = present(&self.endpoint) {
            parse_endpoint("AZURE_OPENAI_ENDPOINT", endpoint)?;
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<EmbeddingCredentials, ConfigError> {
        let endpoint =
            present(&self.endpoint).ok_or(ConfigError::MissingSetting("AZURE_OPENAI_ENDPOINT"))?;
        let api_key =
            present(&self.api_key).ok_or(ConfigError::MissingSetting("AZURE_OPENAI_API_KEY"))?;
        let deployment =
            present(&self.deployment).ok_or(ConfigError::MissingSetting("AOAI_EMBED_MODEL"))?;
        Ok(EmbeddingCredentials {
            endpoint: parse_endpoint("AZURE_OPENAI_ENDPOINT", endpoint)?,
            api_key: api_key.to_string(),
            deployment: deployment.to_string(),
            api_version: self.api_version.clone(),
        })
    }

    #[inline]
    pub fn batch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.batch_delay_seconds.max(0.0))
    }
}

/// Strip whitespace, trailing slashes and legacy `/openai` or `/v1` suffixes.
#[inline]
pub fn normalize_endpoint(endpoint: &str) -> String {
    let mut ep = endpoint.trim().trim_end_matches('/').to_string();
    for suffix in ["/openai/v1", "/openai", "/v1"] {
        if ep.to_ascii_lowercase().ends_with(suffix) {
            ep.truncate(ep.len() - suffix.len());
            break;
        }
    }
    ep.trim_end_matches('/').to_string()
}

/// Show the first four characters of a secret.
#[inline]
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None | Some("") => "(not set)".to_string(),
        Some(s) => {
            let visible: String = s.chars().take(4).collect();
            format!("{visible}****")
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_endpoint(name: &'static str, endpoint: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(endpoint)
        .map_err(|_| ConfigError::InvalidUrl(name, endpoint.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(name, endpoint.to_string()));
    }
    Ok(url)
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidNumber(name, value.to_string()))
}

fn override_opt(target: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *target = value;
    }
}

fn override_string(target: &mut String, value: Option<String>) {
    if let Some(v) = value {
        *target = v;
    }
}
