use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::naming::DEFAULT_PREFIX;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_env")]
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            env: default_env(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GmailConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub token_path: Option<PathBuf>,
    pub api_base: Option<String>,
    pub token_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory of the `fs` backend.
    #[serde(default)]
    pub root: PathBuf,
    /// Explicit key namespace. When unset the default is used, or one is
    /// derived from the account address if `auto_prefix` is on.
    pub prefix: Option<String>,
    #[serde(default)]
    pub auto_prefix: bool,
    #[serde(default)]
    pub s3: S3Config,
}

/// Bucket settings of the `s3` backend. Cloudflare R2 only needs
/// `account_id`; other providers set `endpoint`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub account_id: Option<String>,
    #[serde(default)]
    pub bucket: String,
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
}

impl S3Config {
    pub fn endpoint_url(&self) -> Option<String> {
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            return Some(endpoint.trim_end_matches('/').to_string());
        }
        self.account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("https://{}.r2.cloudflarestorage.com", id.trim()))
    }

    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|region| !region.is_empty())
            .unwrap_or("auto")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_gzip_level")]
    pub gzip_level: u32,
    #[serde(default = "default_max_error_samples")]
    pub max_error_samples: usize,
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            gzip_level: default_gzip_level(),
            max_error_samples: default_max_error_samples(),
            stale_claim_secs: default_stale_claim_secs(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_service_name() -> String {
    "mailvault".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_gzip_level() -> u32 {
    6
}

fn default_max_error_samples() -> usize {
    10
}

fn default_stale_claim_secs() -> u64 {
    6 * 60 * 60
}

fn default_progress_every() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid {var} override: {source}")]
    InvalidNumber {
        var: &'static str,
        source: std::num::ParseIntError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing Gmail OAuth client credentials (gmail.client_id / gmail.client_secret)")]
    MissingCredentials,
    #[error("missing storage destination: {0}")]
    MissingDestination(&'static str),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fails unless OAuth client credentials are present. Only commands that
    /// talk to the mailbox need them.
    pub fn require_gmail_credentials(&self) -> Result<(), ConfigError> {
        if self.gmail.client_id.trim().is_empty() || self.gmail.client_secret.trim().is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }

    pub fn token_path(&self) -> PathBuf {
        self.gmail
            .token_path
            .clone()
            .unwrap_or_else(|| self.paths.state_dir.join("token.json"))
    }

    /// The configured key namespace, or the default when none was given.
    pub fn storage_prefix(&self) -> String {
        self.storage
            .prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string())
    }

    /// Auto-prefix only applies when no prefix was set explicitly.
    pub fn wants_auto_prefix(&self) -> bool {
        self.storage.auto_prefix && self.storage.prefix.is_none()
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.sync.stale_claim_secs)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = env::var("MAILVAULT_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(dir);
        }

        if let Ok(root) = env::var("MAILVAULT_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }

        if let Ok(prefix) = env::var("R2_PREFIX") {
            self.storage.prefix = Some(prefix);
        }

        if let Ok(prefix) = env::var("MAILVAULT_PREFIX") {
            self.storage.prefix = Some(prefix);
        }

        if let Ok(account_id) = env::var("R2_ACCOUNT_ID") {
            self.storage.s3.account_id = Some(account_id);
        }

        if let Ok(bucket) = env::var("R2_BUCKET") {
            self.storage.s3.bucket = bucket;
        }

        if let Ok(region) = env::var("R2_REGION") {
            self.storage.s3.region = Some(region);
        }

        if let Ok(key_id) = env::var("AWS_ACCESS_KEY_ID") {
            self.storage.s3.access_key_id = key_id;
        }

        if let Ok(secret) = env::var("AWS_SECRET_ACCESS_KEY") {
            self.storage.s3.secret_access_key = secret;
        }

        if let Ok(workers) = env::var("MAILVAULT_WORKERS") {
            self.sync.workers = workers
                .parse()
                .map_err(|source| ConfigError::InvalidNumber {
                    var: "MAILVAULT_WORKERS",
                    source,
                })?;
        }

        if let Ok(id) = env::var("GOOGLE_CLIENT_ID") {
            self.gmail.client_id = id;
        }

        if let Ok(secret) = env::var("GOOGLE_CLIENT_SECRET") {
            self.gmail.client_secret = secret;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.gmail.client_id)?;
        apply_env_marker(&mut self.gmail.client_secret)?;
        if let Some(base) = &mut self.gmail.api_base {
            apply_env_marker(base)?;
        }
        if let Some(prefix) = &mut self.storage.prefix {
            apply_env_marker(prefix)?;
        }
        let s3 = &mut self.storage.s3;
        for value in [&mut s3.endpoint, &mut s3.account_id, &mut s3.region]
            .into_iter()
            .flatten()
        {
            apply_env_marker(value)?;
        }
        apply_env_marker(&mut s3.bucket)?;
        apply_env_marker(&mut s3.access_key_id)?;
        apply_env_marker(&mut s3.secret_access_key)?;
        apply_env_marker_path(&mut self.paths.state_dir)?;
        apply_env_marker_path(&mut self.storage.root)?;
        if let Some(token_path) = &mut self.gmail.token_path {
            apply_env_marker_path(token_path)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.paths.state_dir);
        expand_tilde(&mut self.storage.root);
        if let Some(token_path) = &mut self.gmail.token_path {
            expand_tilde(token_path);
        }
        if let Some(prefix) = &mut self.storage.prefix {
            *prefix = prefix.trim_end_matches('/').to_string();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be at least 1".into()));
        }
        if !(1..=9).contains(&self.sync.gzip_level) {
            return Err(ConfigError::Invalid(format!(
                "sync.gzip_level must be between 1 and 9, got {}",
                self.sync.gzip_level
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        self.validate_destination()
    }

    fn validate_destination(&self) -> Result<(), ConfigError> {
        match self.storage.backend {
            StorageBackend::Fs => {
                if self.storage.root.as_os_str().is_empty() {
                    return Err(ConfigError::MissingDestination("storage.root"));
                }
            }
            StorageBackend::S3 => {
                let s3 = &self.storage.s3;
                if s3.endpoint_url().is_none() {
                    return Err(ConfigError::MissingDestination(
                        "storage.s3.endpoint or storage.s3.account_id (R2_ACCOUNT_ID)",
                    ));
                }
                if s3.bucket.trim().is_empty() {
                    return Err(ConfigError::MissingDestination(
                        "storage.s3.bucket (R2_BUCKET)",
                    ));
                }
                if s3.access_key_id.is_empty() || s3.secret_access_key.is_empty() {
                    return Err(ConfigError::MissingDestination(
                        "storage.s3 access keys (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

fn expand_tilde(path: &mut PathBuf) {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&raw);
    *path = PathBuf::from(expanded.as_ref());
}
